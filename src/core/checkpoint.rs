use crate::core::Error;
use crate::core::layers::ParamEntry;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "checkpoint.json";
pub const CONFIG_FILE: &str = "model.config.json";

pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Pointer file of a checkpoint directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointManifest {
    pub latest: usize,
    /// Retained steps, oldest first
    pub steps: Vec<usize>,
    /// Names and shapes of every persisted parameter
    pub params: Vec<ParamEntry>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointManifest {
    pub fn param(&self, key: &str) -> Option<&ParamEntry> {
        self.params.iter().find(|p| p.key == key)
    }
}

/// One directory of immutable `model-<step>.mpk` snapshots plus a manifest.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
    max_to_keep: Option<usize>,
}

impl CheckpointDir {
    pub fn new(root: impl Into<PathBuf>, max_to_keep: Option<usize>) -> Self {
        Self {
            root: root.into(),
            max_to_keep,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stem(&self, step: usize) -> PathBuf {
        self.root.join(format!("model-{step}"))
    }

    pub fn model_path(&self, step: usize) -> PathBuf {
        self.root.join(format!("model-{step}.mpk"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn exists(&self) -> bool {
        self.manifest_path().is_file()
    }

    pub fn manifest(&self) -> Result<CheckpointManifest, Error> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Err(Error::MissingCheckpoint { path: self.root.clone() });
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Writes the snapshot for `step`, updates the manifest and prunes old snapshots.
    pub fn save<B, M>(
        &self,
        model: &M,
        step: usize,
        params: Vec<ParamEntry>,
    ) -> Result<PathBuf, Error>
    where
        B: Backend,
        M: Module<B>,
    {
        fs::create_dir_all(&self.root)?;

        let path = self.model_path(step);
        if path.exists() {
            return Err(Error::CheckpointExists { step, path });
        }

        model
            .clone()
            .save_file(self.stem(step), &CheckpointRecorder::new())
            .map_err(|e| Error::Recorder(format!("Failed to save model to {path:?}: {e}")))?;

        let mut steps = if self.exists() {
            self.manifest()?.steps
        } else {
            Vec::new()
        };
        steps.push(step);

        if let Some(keep) = self.max_to_keep {
            while steps.len() > keep {
                let old = steps.remove(0);
                let old_path = self.model_path(old);
                if old_path.exists() {
                    fs::remove_file(&old_path)?;
                }
                tracing::debug!(step = old, path = ?old_path, "Pruned checkpoint");
            }
        }

        let manifest = CheckpointManifest {
            latest: step,
            steps,
            params,
            updated_at: Utc::now(),
        };
        fs::write(self.manifest_path(), serde_json::to_string_pretty(&manifest)?)?;

        tracing::info!(step, path = ?path, "Checkpoint saved");
        Ok(path)
    }

    /// Loads the latest snapshot into `model`. Returns the model and the step it was saved at.
    pub fn load_latest<B, M>(&self, model: M, device: &B::Device) -> Result<(M, usize), Error>
    where
        B: Backend,
        M: Module<B>,
    {
        let step = self.manifest()?.latest;
        Ok((self.load_step(model, step, device)?, step))
    }

    /// Loads the snapshot saved at `step` into `model`.
    pub fn load_step<B, M>(&self, model: M, step: usize, device: &B::Device) -> Result<M, Error>
    where
        B: Backend,
        M: Module<B>,
    {
        let path = self.model_path(step);
        if !path.is_file() {
            return Err(Error::MissingCheckpoint { path });
        }

        let model = model
            .load_file(self.stem(step), &CheckpointRecorder::new(), device)
            .map_err(|e| Error::Recorder(format!("Failed to load model from {path:?}: {e}")))?;

        tracing::info!(step, path = ?path, "Checkpoint restored");
        Ok(model)
    }

    /// Fails when this directory already holds checkpoints of an earlier run.
    pub fn ensure_fresh(&self) -> Result<(), Error> {
        if !self.exists() {
            return Ok(());
        }
        let step = self.manifest()?.latest;
        Err(Error::CheckpointExists {
            step,
            path: self.model_path(step),
        })
    }

    pub fn save_config<T: Serialize>(&self, config: &T) -> Result<(), Error> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.config_path(), serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    pub fn load_config<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let path = self.config_path();
        if !path.is_file() {
            return Err(Error::MissingCheckpoint { path });
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
