use super::Error;
use crate::core::dataset::Sample;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Deserialize)]
struct LabelRow {
    patient: String,
    label: usize,
}

#[derive(Deserialize)]
struct SplitRow {
    patient: String,
    split: Split,
}

/// Which partition of the data a patient belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
}

/// Patient code -> class label, loaded once from a `patient,label` CSV.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: HashMap<String, usize>,
}

impl LabelTable {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut labels = HashMap::new();
        for row in reader.deserialize() {
            let row: LabelRow = row?;
            labels.insert(row.patient, row.label);
        }

        Ok(Self { labels })
    }

    pub fn get(&self, patient: &str) -> Option<usize> {
        self.labels.get(patient).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Patient code -> train/valid assignment, loaded once from a `patient,split` CSV.
#[derive(Debug, Clone, Default)]
pub struct SplitTable {
    splits: BTreeMap<String, Split>,
}

impl SplitTable {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut splits = BTreeMap::new();
        for row in reader.deserialize() {
            let row: SplitRow = row?;
            splits.insert(row.patient, row.split);
        }

        Ok(Self { splits })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Split)> {
        self.splits.iter().map(|(p, s)| (p.as_str(), *s))
    }
}

/// Finds every file below `dir` whose name ends in `suffix`. The patient code is the
/// file name with the suffix removed.
pub fn discover_volumes(dir: &Path, suffix: &str) -> Result<BTreeMap<String, PathBuf>, Error> {
    let mut found = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(patient) = name.strip_suffix(suffix) {
                if !patient.is_empty() {
                    found.insert(patient.to_string(), path.clone());
                }
            }
        }
    }

    Ok(found)
}

/// Where the volumes of one modality live.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModalityDir {
    pub modality: String,
    pub dir: PathBuf,
    pub suffix: String,
}

/// Per-class sample lists for both splits. `train[c]` holds every training sample of class `c`.
#[derive(Debug, Clone, Default)]
pub struct DatasetIndex {
    pub train: Vec<Vec<Sample>>,
    pub valid: Vec<Vec<Sample>>,
}

/// Locations of the label table, the split table and the per-modality volume directories.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataPaths {
    pub class_labels: PathBuf,
    pub splits: PathBuf,
    pub modalities: Vec<ModalityDir>,
}

impl DataPaths {
    fn modality_dir(&self, modality: &str) -> Result<&ModalityDir, Error> {
        self.modalities
            .iter()
            .find(|m| m.modality == modality)
            .ok_or_else(|| Error::UnknownModality(modality.to_string()))
    }

    /// Builds per-class partitions for the given modalities. A patient is only kept when it
    /// has a label and a volume for every modality; file order follows `modalities`.
    pub fn index(&self, modalities: &[String], classes: usize) -> Result<DatasetIndex, Error> {
        let labels = LabelTable::load(&self.class_labels)?;
        let splits = SplitTable::load(&self.splits)?;

        let volumes = modalities
            .iter()
            .map(|m| {
                let dir = self.modality_dir(m)?;
                let found = discover_volumes(&dir.dir, &dir.suffix)?;
                tracing::debug!(modality = %m, volumes = found.len(), "Discovered volumes");
                Ok(found)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut index = DatasetIndex {
            train: vec![Vec::new(); classes],
            valid: vec![Vec::new(); classes],
        };
        let mut skipped = 0usize;

        for (patient, split) in splits.iter() {
            let Some(label) = labels.get(patient) else {
                tracing::warn!(patient, "Patient has no class label, skipping");
                skipped += 1;
                continue;
            };
            if label >= classes {
                return Err(Error::InvalidLabel {
                    patient: patient.to_string(),
                    label,
                    classes,
                });
            }

            let files: Option<Vec<PathBuf>> =
                volumes.iter().map(|v| v.get(patient).cloned()).collect();
            let Some(files) = files else {
                skipped += 1;
                continue;
            };

            let sample = Sample {
                patient: patient.to_string(),
                files,
                label,
            };
            match split {
                Split::Train => index.train[label].push(sample),
                Split::Valid => index.valid[label].push(sample),
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                "Patients without a label or without a volume for every modality were left out"
            );
        }

        Ok(index)
    }
}
