mod labels;
mod volume;

pub use labels::{DataPaths, DatasetIndex, LabelTable, ModalityDir, Split, SplitTable};
pub use labels::discover_volumes;
pub use volume::{RawVolumeReader, VolumeReader, VolumeShape};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not read file: {0}")]
    ReadError(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Patient {patient} has label {label}, but only {classes} classes are configured")]
    InvalidLabel {
        patient: String,
        label: usize,
        classes: usize,
    },
    #[error("Volume {path:?} holds {got} values, expected {expected}")]
    VolumeSize {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
    #[error("No data directory configured for modality '{0}'")]
    UnknownModality(String),
}
