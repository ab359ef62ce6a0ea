use crate::core::Error;
use crate::core::checkpoint::CheckpointDir;
use crate::core::head::{FusionHeadConfig, FusionLayer};
use crate::core::layers::LossCollection;
use crate::core::model::{ClassifierConfig, ModelConfig, TowerSource, VolumeClassifier};
use crate::core::restore::RestorePlan;
use crate::core::tower::Tower;
use crate::core::train::FeatureSource;
use burn::prelude::*;
use std::path::{Path, PathBuf};

/// A pretrained tower restored from its checkpoint directory, forward pass only.
///
/// Each instance owns its parameters; nothing is shared with other towers or with the
/// model being trained.
pub struct FrozenTower<B: Backend> {
    modality: String,
    config: ClassifierConfig,
    tower: Tower<B>,
    dir: PathBuf,
    step: usize,
}

impl<B: Backend> FrozenTower<B> {
    /// Restores the latest checkpoint in `dir`.
    pub fn open(modality: &str, dir: &Path, device: &B::Device) -> Result<Self, Error> {
        Self::restore(modality, dir, None, device)
    }

    /// Restores exactly the checkpoint recorded in `source`.
    pub fn open_source(source: &TowerSource, device: &B::Device) -> Result<Self, Error> {
        Self::restore(&source.modality, &source.dir, Some(source.step), device)
    }

    fn restore(
        modality: &str,
        dir: &Path,
        step: Option<usize>,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let checkpoints = CheckpointDir::new(dir, None);
        let manifest = checkpoints.manifest()?;

        let config = match checkpoints.load_config::<ModelConfig>()? {
            ModelConfig::Classifier(config) if config.modality == modality => config,
            _ => {
                return Err(Error::WrongModel {
                    path: dir.to_path_buf(),
                    expected: format!("{modality} classifier"),
                });
            }
        };

        let model = config.init::<B>(device)?;
        RestorePlan::full(&config).validate(&model.param_entries(), &manifest, dir)?;
        let step = step.unwrap_or(manifest.latest);
        let model = checkpoints.load_step(model, step, device)?;

        tracing::info!(modality, step, path = ?dir, "Feature extractor restored");

        Ok(Self {
            modality: modality.to_string(),
            config,
            tower: model.tower.no_grad(),
            dir: dir.to_path_buf(),
            step,
        })
    }

    /// Where this tower was restored from.
    pub fn source(&self) -> TowerSource {
        TowerSource {
            modality: self.modality.clone(),
            dir: self.dir.clone(),
            step: self.step,
        }
    }

    pub fn modality(&self) -> &str {
        &self.modality
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Training step of the restored checkpoint.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Activation of `conv<layer>` for a batch `[N, C, D, H, W]`.
    pub fn extract(&self, images: Tensor<B, 5>, layer: usize) -> Result<Tensor<B, 5>, Error> {
        let volume = &self.config.volume;
        self.config.tower.feature_shape(volume.spatial(), layer)?;

        let [_, c, d, h, w] = images.dims();
        let expected = [volume.channels, volume.depth, volume.height, volume.width];
        if [c, d, h, w] != expected {
            return Err(Error::shape_mismatch(
                format!("{} input", self.modality),
                &expected,
                &[c, d, h, w],
            ));
        }

        Ok(self
            .tower
            .forward_to(images, layer, &mut LossCollection::detached()))
    }
}

/// Frozen towers for every fused modality, in input order.
pub struct FeatureExtractor<B: Backend> {
    towers: Vec<FrozenTower<B>>,
    layer: FusionLayer,
}

impl<B: Backend> FeatureExtractor<B> {
    /// Restores one tower per modality from the directory `dir_of(modality)`.
    pub fn open(
        modalities: &[String],
        dir_of: impl Fn(&str) -> PathBuf,
        layer: FusionLayer,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let towers = modalities
            .iter()
            .map(|m| FrozenTower::open(m, &dir_of(m), device))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { towers, layer })
    }

    /// Restores the towers a fusion head was trained against.
    pub fn from_sources(
        sources: &[TowerSource],
        layer: FusionLayer,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let towers = sources
            .iter()
            .map(|source| FrozenTower::open_source(source, device))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { towers, layer })
    }

    pub fn sources(&self) -> Vec<TowerSource> {
        self.towers.iter().map(FrozenTower::source).collect()
    }

    pub fn layer(&self) -> FusionLayer {
        self.layer
    }

    /// Shape `[sum C, d, h, w]` of the concatenated features of one sample.
    pub fn fused_shape(&self) -> Result<[usize; 4], Error> {
        let mut fused: Option<[usize; 4]> = None;

        for tower in &self.towers {
            let config = &tower.config;
            let [c, d, h, w] = config
                .tower
                .feature_shape(config.volume.spatial(), self.layer.layer_index(&config.tower))?;

            fused = Some(match fused {
                None => [c, d, h, w],
                Some([fc, fd, fh, fw]) => {
                    if [fd, fh, fw] != [d, h, w] {
                        return Err(Error::shape_mismatch(
                            format!("{} {} features", tower.modality, self.layer),
                            &[fd, fh, fw],
                            &[d, h, w],
                        ));
                    }
                    [fc + c, d, h, w]
                }
            });
        }

        fused.ok_or_else(|| Error::Dataset("no modalities to fuse".to_string()))
    }

    /// Fusion head sized for these extractors.
    pub fn head_config(&self, hidden: usize, classes: usize) -> Result<FusionHeadConfig, Error> {
        let tower = self
            .towers
            .first()
            .ok_or_else(|| Error::Dataset("no modalities to fuse".to_string()))?;
        FusionHeadConfig::for_features(
            self.layer,
            self.fused_shape()?,
            &tower.config.tower,
            hidden,
            classes,
        )
    }

    /// Runs every tower on its own modality and concatenates the activations on the channel axis.
    pub fn fuse(&self, volumes: Vec<Tensor<B, 5>>) -> Result<Tensor<B, 5>, Error> {
        if volumes.len() != self.towers.len() {
            return Err(Error::shape_mismatch(
                "modality inputs",
                &[self.towers.len()],
                &[volumes.len()],
            ));
        }

        let features = self
            .towers
            .iter()
            .zip(volumes)
            .map(|(tower, images)| {
                let layer = self.layer.layer_index(&tower.config.tower);
                tower.extract(images, layer)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Tensor::cat(features, 1))
    }
}

impl<B: Backend> FeatureSource<B> for FeatureExtractor<B> {
    fn arity(&self) -> usize {
        self.towers.len()
    }

    fn features(&self, volumes: Vec<Tensor<B, 5>>) -> Result<Tensor<B, 5>, Error> {
        self.fuse(volumes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::model::tests::tiny_classifier;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    /// Writes a randomly initialised tiny classifier as a pretrained checkpoint.
    pub(crate) fn pretrained<B: Backend>(
        root: &Path,
        modality: &str,
        device: &B::Device,
    ) -> PathBuf {
        let dir = root.join(modality);
        let checkpoints = CheckpointDir::new(&dir, None);
        let config = tiny_classifier(modality);
        let model = config.init::<B>(device).unwrap();
        checkpoints.save_config(&ModelConfig::Classifier(config)).unwrap();
        checkpoints.save(&model, 1, model.param_entries()).unwrap();
        dir
    }

    #[test]
    fn test_missing_checkpoint_is_explicit() {
        let root = TempDir::new().unwrap();
        let device = Default::default();

        let result = FrozenTower::<TestBackend>::open("CBF", &root.path().join("CBF"), &device);

        assert!(matches!(result, Err(Error::MissingCheckpoint { .. })));
    }

    #[test]
    fn test_frozen_tower_matches_source_activations() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let dir = root.path().join("CBF");
        let checkpoints = CheckpointDir::new(&dir, None);
        let config = tiny_classifier("CBF");
        let model = config.init::<TestBackend>(&device).unwrap();
        checkpoints.save_config(&ModelConfig::Classifier(config)).unwrap();
        checkpoints.save(&model, 4, model.param_entries()).unwrap();

        let frozen = FrozenTower::<TestBackend>::open("CBF", &dir, &device).unwrap();
        let x = Tensor::<TestBackend, 5>::random(
            [2, 1, 8, 8, 8],
            burn::tensor::Distribution::Default,
            &device,
        );

        let got: Vec<f32> = frozen.extract(x.clone(), 1).unwrap().into_data().to_vec().unwrap();
        let want: Vec<f32> = model
            .tower
            .forward_to(x, 1, &mut LossCollection::new())
            .into_data()
            .to_vec()
            .unwrap();

        assert_eq!(frozen.step(), 4);
        assert_eq!(got, want);
    }

    #[test]
    fn test_open_source_pins_the_recorded_step() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let dir = pretrained::<TestBackend>(root.path(), "CBF", &device);
        let checkpoints = CheckpointDir::new(&dir, None);
        let newer = tiny_classifier("CBF").init::<TestBackend>(&device).unwrap();
        checkpoints.save(&newer, 2, newer.param_entries()).unwrap();

        let pinned = FeatureExtractor::<TestBackend>::from_sources(
            &[TowerSource {
                modality: "CBF".to_string(),
                dir: dir.clone(),
                step: 1,
            }],
            FusionLayer::Conv7,
            &device,
        )
        .unwrap();
        let latest = FeatureExtractor::<TestBackend>::open(
            &["CBF".to_string()],
            |_| dir.clone(),
            FusionLayer::Conv7,
            &device,
        )
        .unwrap();

        assert_eq!(pinned.sources()[0].step, 1);
        assert_eq!(latest.sources()[0].step, 2);
        assert_eq!(latest.sources()[0].dir, dir);
    }

    #[test]
    fn test_wrong_modality_is_rejected() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let dir = pretrained::<TestBackend>(root.path(), "CBF", &device);

        let result = FrozenTower::<TestBackend>::open("T1_brain", &dir, &device);

        assert!(matches!(result, Err(Error::WrongModel { .. })));
    }

    #[test]
    fn test_fuse_concatenates_channels() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let modalities = vec!["T1_brain".to_string(), "CBF".to_string(), "DTI_FA".to_string()];
        for m in &modalities {
            pretrained::<TestBackend>(root.path(), m, &device);
        }

        let conv7 = FeatureExtractor::<TestBackend>::open(
            &modalities,
            |m| root.path().join(m),
            FusionLayer::Conv7,
            &device,
        )
        .unwrap();
        let volumes = vec![Tensor::<TestBackend, 5>::ones([2, 1, 8, 8, 8], &device); 3];

        assert_eq!(conv7.fused_shape().unwrap(), [18, 1, 1, 1]);
        assert_eq!(conv7.fuse(volumes.clone()).unwrap().dims(), [2, 18, 1, 1, 1]);
        assert_eq!(conv7.head_config(5, 2).unwrap().fusion_width, 18);

        let conv1 = FeatureExtractor::<TestBackend>::open(
            &modalities,
            |m| root.path().join(m),
            FusionLayer::Conv1,
            &device,
        )
        .unwrap();
        assert_eq!(conv1.fuse(volumes).unwrap().dims(), [2, 12, 4, 4, 4]);
        assert_eq!(conv1.head_config(5, 2).unwrap().trunk.len(), 2);
    }

    #[test]
    fn test_fuse_rejects_wrong_arity() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        pretrained::<TestBackend>(root.path(), "CBF", &device);
        let extractor = FeatureExtractor::<TestBackend>::open(
            &["CBF".to_string()],
            |m| root.path().join(m),
            FusionLayer::Conv7,
            &device,
        )
        .unwrap();

        let result = extractor.fuse(vec![Tensor::ones([1, 1, 8, 8, 8], &device); 2]);

        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
