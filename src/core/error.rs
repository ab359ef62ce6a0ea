use crate::core::{ingestion, train_config};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] train_config::Error),
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] ingestion::Error),
    #[error("No checkpoint found at {path:?}")]
    MissingCheckpoint { path: PathBuf },
    #[error("Checkpoint for step {step} already exists at {path:?}")]
    CheckpointExists { step: usize, path: PathBuf },
    #[error("Parameter '{key}' is not present in checkpoint {path:?}")]
    MissingParameter { key: String, path: PathBuf },
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Checkpoint at {path:?} does not hold a {expected} model")]
    WrongModel { path: PathBuf, expected: String },
    #[error("Unknown layer '{0}'")]
    UnknownLayer(String),
    #[error("Loss diverged to NaN at step {step}")]
    Diverged { step: usize },
    #[error("Recorder error: {0}")]
    Recorder(String),
    #[error("Dataset error: {0}")]
    Dataset(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn shape_mismatch(what: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
