use crate::core::dataset::TailPolicy;
use crate::core::head::FusionLayer;
use crate::core::ingestion::VolumeShape;
use crate::core::tower::TowerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::{fs, io};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn default_decay_every_epochs() -> usize {
    1
}

fn default_decay_factor() -> f64 {
    0.5
}

fn default_keep_prob() -> f64 {
    1.0
}

fn default_log_every() -> usize {
    50
}

fn default_hidden_units() -> usize {
    512
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub batch_size: usize,
    #[serde(flatten)]
    pub volume: VolumeShape,
    /// L2 coefficient applied to every weight tensor. 0.0 = no regularization terms
    #[serde(default)]
    pub decay_const: f64,
    pub learning_rate: f64,
    /// Staircase learning-rate decay switch
    #[serde(default)]
    pub decay_lr: bool,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "default_decay_every_epochs")]
    pub decay_every_epochs: usize,
    pub num_epochs: usize,
    /// Dropout keep probability of the penultimate dense layer
    #[serde(default = "default_keep_prob")]
    pub keep_prob: f64,
    pub classes: usize,
    pub modalities: Vec<String>,
    #[serde(default)]
    pub fusion_layer: FusionLayer,
    pub checkpoint_path: PathBuf,
    /// JSON-lines summary file. None = no summaries
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
    /// Number of checkpoints retained. None = keep all
    #[serde(default)]
    pub max_to_keep: Option<usize>,
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,
    /// Per-modality checkpoint directories used for extraction. Missing entries default to
    /// `<checkpoint_path>/<modality>`
    #[serde(default)]
    pub pretrained: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub tail_policy: TailPolicy,
    /// Tower architecture. None = the reference tower
    #[serde(default)]
    pub tower: Option<TowerConfig>,
}

impl TrainConfig {
    pub fn new(
        batch_size: usize,
        volume: VolumeShape,
        learning_rate: f64,
        num_epochs: usize,
        classes: usize,
        modalities: Vec<String>,
        checkpoint_path: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        Self::validate_classes(&classes)?;
        Self::validate_batch_size(&batch_size, &classes)?;
        Self::validate_volume(&volume)?;
        Self::validate_learning_rate(&learning_rate)?;
        Self::validate_num_epochs(&num_epochs)?;
        Self::validate_modalities(&modalities)?;

        Ok(Self {
            batch_size,
            volume,
            decay_const: 0.0,
            learning_rate,
            decay_lr: false,
            decay_factor: default_decay_factor(),
            decay_every_epochs: default_decay_every_epochs(),
            num_epochs,
            keep_prob: default_keep_prob(),
            classes,
            modalities,
            fusion_layer: FusionLayer::default(),
            checkpoint_path: checkpoint_path.into(),
            summary_path: None,
            max_to_keep: None,
            log_every: default_log_every(),
            seed: 0,
            hidden_units: default_hidden_units(),
            pretrained: BTreeMap::new(),
            tail_policy: TailPolicy::default(),
            tower: None,
        })
    }

    /// Builder method to set the L2 weight decay constant
    pub fn with_decay_const(mut self, decay_const: f64) -> Result<Self, Error> {
        Self::validate_decay_const(&decay_const)?;
        self.decay_const = decay_const;
        Ok(self)
    }

    /// Builder method to enable staircase learning-rate decay
    pub fn with_lr_decay(mut self, factor: f64, every_epochs: usize) -> Result<Self, Error> {
        Self::validate_decay_factor(&factor)?;
        Self::validate_decay_every_epochs(&every_epochs)?;
        self.decay_lr = true;
        self.decay_factor = factor;
        self.decay_every_epochs = every_epochs;
        Ok(self)
    }

    pub fn with_keep_prob(mut self, keep_prob: f64) -> Result<Self, Error> {
        Self::validate_keep_prob(&keep_prob)?;
        self.keep_prob = keep_prob;
        Ok(self)
    }

    pub fn with_fusion_layer(mut self, fusion_layer: FusionLayer) -> Self {
        self.fusion_layer = fusion_layer;
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    pub fn with_max_to_keep(mut self, max_to_keep: usize) -> Result<Self, Error> {
        Self::validate_max_to_keep(&max_to_keep)?;
        self.max_to_keep = Some(max_to_keep);
        Ok(self)
    }

    pub fn with_log_every(mut self, log_every: usize) -> Result<Self, Error> {
        Self::validate_log_every(&log_every)?;
        self.log_every = log_every;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_hidden_units(mut self, hidden_units: usize) -> Result<Self, Error> {
        Self::validate_hidden_units(&hidden_units)?;
        self.hidden_units = hidden_units;
        Ok(self)
    }

    pub fn with_pretrained(mut self, modality: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.pretrained.insert(modality.into(), dir.into());
        self
    }

    pub fn with_tail_policy(mut self, tail_policy: TailPolicy) -> Self {
        self.tail_policy = tail_policy;
        self
    }

    pub fn with_tower(mut self, tower: TowerConfig) -> Result<Self, Error> {
        Self::validate_tower(&tower, &self.volume)?;
        self.tower = Some(tower);
        Ok(self)
    }

    /// Configured tower, or the reference tower for `volume.channels` inputs.
    pub fn tower_config(&self) -> TowerConfig {
        self.tower
            .clone()
            .unwrap_or_else(|| TowerConfig::paper(self.volume.channels))
            .with_decay(self.decay_const)
    }

    /// Samples drawn from every class partition per batch.
    pub fn per_class_batch(&self) -> usize {
        self.batch_size / self.classes
    }

    /// Checkpoint directory holding the pretrained tower of `modality`.
    pub fn pretrained_dir(&self, modality: &str) -> PathBuf {
        self.pretrained
            .get(modality)
            .cloned()
            .unwrap_or_else(|| self.checkpoint_path.join(modality))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Re-checks every field. Used after deserialization.
    pub fn validate(&self) -> Result<(), Error> {
        Self::validate_classes(&self.classes)?;
        Self::validate_batch_size(&self.batch_size, &self.classes)?;
        Self::validate_volume(&self.volume)?;
        Self::validate_learning_rate(&self.learning_rate)?;
        Self::validate_num_epochs(&self.num_epochs)?;
        Self::validate_modalities(&self.modalities)?;
        Self::validate_decay_const(&self.decay_const)?;
        Self::validate_keep_prob(&self.keep_prob)?;
        Self::validate_log_every(&self.log_every)?;
        Self::validate_hidden_units(&self.hidden_units)?;

        if self.decay_lr {
            Self::validate_decay_factor(&self.decay_factor)?;
            Self::validate_decay_every_epochs(&self.decay_every_epochs)?;
        }

        self.max_to_keep
            .as_ref()
            .map(Self::validate_max_to_keep)
            .transpose()?;

        if let Some(tower) = &self.tower {
            Self::validate_tower(tower, &self.volume)?;
        }

        Ok(())
    }

    fn validate_classes(classes: &usize) -> Result<(), Error> {
        if *classes < 2 {
            return Err(Error::Validation(
                "classes must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_batch_size(batch_size: &usize, classes: &usize) -> Result<(), Error> {
        if *batch_size < 1 {
            return Err(Error::Validation(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if batch_size % classes != 0 {
            return Err(Error::Validation(format!(
                "batch_size {batch_size} must be divisible by classes {classes}"
            )));
        }
        Ok(())
    }

    fn validate_volume(volume: &VolumeShape) -> Result<(), Error> {
        if volume.is_empty() {
            return Err(Error::Validation(
                "depth, height, width and channels must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_learning_rate(learning_rate: &f64) -> Result<(), Error> {
        if !(*learning_rate > 0.0) {
            return Err(Error::Validation(
                "learning_rate must be greater than 0.0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_num_epochs(num_epochs: &usize) -> Result<(), Error> {
        if *num_epochs < 1 {
            return Err(Error::Validation(
                "num_epochs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_modalities(modalities: &[String]) -> Result<(), Error> {
        if modalities.is_empty() {
            return Err(Error::Validation("modalities must not be empty".to_string()));
        }
        let unique: HashSet<&String> = modalities.iter().collect();
        if unique.len() != modalities.len() {
            return Err(Error::Validation(
                "modalities must not contain duplicates".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_decay_const(decay_const: &f64) -> Result<(), Error> {
        if !(*decay_const >= 0.0) {
            return Err(Error::Validation(
                "decay_const must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_tower(tower: &TowerConfig, volume: &VolumeShape) -> Result<(), Error> {
        if tower.in_channels != volume.channels {
            return Err(Error::Validation(format!(
                "tower in_channels {} does not match volume channels {}",
                tower.in_channels, volume.channels
            )));
        }
        if tower.branch_kernels.is_empty() {
            return Err(Error::Validation(
                "tower must have at least one branch kernel".to_string(),
            ));
        }
        if tower.branch_channels < 1 || tower.stages.iter().any(|s| s.channels < 1) {
            return Err(Error::Validation(
                "tower channels must be greater than 0".to_string(),
            ));
        }
        if tower.branch_kernels.contains(&0) || tower.stages.iter().any(|s| s.kernel < 1) {
            return Err(Error::Validation(
                "tower kernels must be greater than 0".to_string(),
            ));
        }
        if tower.branch_stride < 1 || tower.stages.iter().any(|s| s.stride < 1) {
            return Err(Error::Validation(
                "tower strides must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_decay_factor(decay_factor: &f64) -> Result<(), Error> {
        if !(*decay_factor > 0.0 && *decay_factor <= 1.0) {
            return Err(Error::Validation(
                "decay_factor must be in (0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_decay_every_epochs(every: &usize) -> Result<(), Error> {
        if *every < 1 {
            return Err(Error::Validation(
                "decay_every_epochs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_keep_prob(keep_prob: &f64) -> Result<(), Error> {
        if !(*keep_prob > 0.0 && *keep_prob <= 1.0) {
            return Err(Error::Validation(
                "keep_prob must be in (0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_max_to_keep(max_to_keep: &usize) -> Result<(), Error> {
        if *max_to_keep < 1 {
            return Err(Error::Validation(
                "max_to_keep must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_log_every(log_every: &usize) -> Result<(), Error> {
        if *log_every < 1 {
            return Err(Error::Validation(
                "log_every must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_hidden_units(hidden_units: &usize) -> Result<(), Error> {
        if *hidden_units < 1 {
            return Err(Error::Validation(
                "hidden_units must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
