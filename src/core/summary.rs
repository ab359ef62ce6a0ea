use crate::core::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// One line of the summary file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SummaryEvent {
    Step {
        step: usize,
        loss: f32,
        cross_entropy: f32,
        weight_decay: f32,
        learning_rate: f64,
    },
    BatchAccuracy {
        step: usize,
        accuracy: f32,
        examples_per_sec: f64,
    },
    Evaluation {
        step: usize,
        epoch: usize,
        split: String,
        patient_accuracy: f32,
        sample_accuracy: f32,
        cross_entropy: f32,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SummaryEvent,
}

/// Appends scalar summaries as JSON lines. A writer without a path discards everything.
pub struct SummaryWriter {
    out: Option<BufWriter<File>>,
}

impl SummaryWriter {
    pub fn disabled() -> Self {
        Self { out: None }
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!(path = ?path, "Writing summaries");
        Ok(Self {
            out: Some(BufWriter::new(file)),
        })
    }

    pub fn from_path(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => Self::open(path),
            None => Ok(Self::disabled()),
        }
    }

    pub fn write(&mut self, event: SummaryEvent) -> Result<(), Error> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        let record = SummaryRecord {
            time: Utc::now(),
            event,
        };
        serde_json::to_writer(&mut *out, &record)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }
}
