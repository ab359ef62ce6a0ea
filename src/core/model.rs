use crate::core::Error;
use crate::core::head::{DenseHead, DenseHeadConfig, FusionHead, FusionHeadConfig};
use crate::core::ingestion::VolumeShape;
use crate::core::layers::{LossCollection, ParamEntry};
use crate::core::tower::{Tower, TowerConfig};
use crate::core::train_config::TrainConfig;
use burn::module::Ignored;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Trait for models that map a 5D input batch to class logits
pub trait VolumeClassifier<B: Backend>: Module<B> + Sized {
    fn forward(&self, input: Tensor<B, 5>, losses: &mut LossCollection<B>) -> Tensor<B, 2>;

    fn param_entries(&self) -> Vec<ParamEntry>;

    fn check_input(&self, _dims: [usize; 5]) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Config, Debug, PartialEq)]
pub struct ClassifierConfig {
    /// Parameter scope of the tower and head
    pub modality: String,
    pub volume: VolumeShape,
    pub tower: TowerConfig,
    pub hidden: usize,
    pub classes: usize,
    #[config(default = 1.0)]
    pub keep_prob: f64,
    #[config(default = 0.0)]
    pub decay: f64,
}

impl ClassifierConfig {
    /// Configured tower plus dense head, sized from the training parameters.
    pub fn from_train_config(modality: &str, config: &TrainConfig) -> Self {
        Self::new(
            modality.to_string(),
            config.volume,
            config.tower_config(),
            config.hidden_units,
            config.classes,
        )
        .with_keep_prob(config.keep_prob)
        .with_decay(config.decay_const)
    }

    pub fn head_config(&self) -> Result<DenseHeadConfig, Error> {
        let [c, d, h, w] = self
            .tower
            .feature_shape(self.volume.spatial(), self.tower.depth())?;

        Ok(DenseHeadConfig::new(c * d * h * w, self.hidden, self.classes)
            .with_keep_prob(self.keep_prob)
            .with_decay(self.decay))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Classifier<B>, Error> {
        if self.tower.in_channels != self.volume.channels {
            return Err(Error::shape_mismatch(
                "tower input channels",
                &[self.volume.channels],
                &[self.tower.in_channels],
            ));
        }

        let head = self.head_config()?;
        let [d, h, w] = self.volume.spatial();

        Ok(Classifier {
            tower: self.tower.init(&self.modality, device),
            head: head.init(&self.modality, device),
            input: Ignored([self.volume.channels, d, h, w]),
        })
    }
}

/// Single-modality tower with a dense classification head.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    pub tower: Tower<B>,
    pub head: DenseHead<B>,
    pub input: Ignored<[usize; 4]>,
}

impl<B: Backend> VolumeClassifier<B> for Classifier<B> {
    fn forward(&self, input: Tensor<B, 5>, losses: &mut LossCollection<B>) -> Tensor<B, 2> {
        let features = self.tower.forward(input, losses);
        let [n, c, d, h, w] = features.dims();
        self.head.forward(features.reshape([n, c * d * h * w]), losses)
    }

    fn param_entries(&self) -> Vec<ParamEntry> {
        let mut entries = self.tower.param_entries();
        entries.extend(self.head.param_entries());
        entries
    }

    fn check_input(&self, dims: [usize; 5]) -> Result<(), Error> {
        if dims[1..] != self.input.0[..] {
            return Err(Error::shape_mismatch("classifier input", &self.input.0, &dims[1..]));
        }
        Ok(())
    }
}

impl<B: Backend> VolumeClassifier<B> for FusionHead<B> {
    fn forward(&self, input: Tensor<B, 5>, losses: &mut LossCollection<B>) -> Tensor<B, 2> {
        FusionHead::forward(self, input, losses)
    }

    fn param_entries(&self) -> Vec<ParamEntry> {
        FusionHead::param_entries(self)
    }

    fn check_input(&self, dims: [usize; 5]) -> Result<(), Error> {
        FusionHead::check_input(self, dims)
    }
}

/// Pretrained checkpoint a fusion head was trained against.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TowerSource {
    pub modality: String,
    pub dir: PathBuf,
    pub step: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FusionConfig {
    /// Frozen towers in input order
    pub towers: Vec<TowerSource>,
    pub head: FusionHeadConfig,
}

impl FusionConfig {
    pub fn modalities(&self) -> Vec<String> {
        self.towers.iter().map(|t| t.modality.clone()).collect()
    }
}

/// Architecture persisted next to a run's checkpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelConfig {
    Classifier(ClassifierConfig),
    Fusion(FusionConfig),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::head::FusionLayer;
    use crate::core::tower::tests::tiny_tower;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    pub(crate) fn tiny_classifier(modality: &str) -> ClassifierConfig {
        ClassifierConfig::new(
            modality.to_string(),
            VolumeShape::new(8, 8, 8, 1),
            tiny_tower(),
            5,
            2,
        )
    }

    #[test]
    fn test_classifier_forward_produces_logits() {
        let device = Default::default();
        let model = tiny_classifier("T1_brain").init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 5>::ones([4, 1, 8, 8, 8], &device);

        model.check_input(x.dims()).unwrap();
        let logits = VolumeClassifier::forward(&model, x, &mut LossCollection::new());

        assert_eq!(logits.dims(), [4, 2]);
        assert!(model.check_input([4, 1, 8, 8, 9]).is_err());
    }

    #[test]
    fn test_classifier_param_entries_cover_tower_and_head() {
        let device = Default::default();
        let model = tiny_classifier("CBF").init::<TestBackend>(&device).unwrap();
        let keys: Vec<String> = model.param_entries().into_iter().map(|e| e.key).collect();

        assert_eq!(keys.len(), 12);
        assert_eq!(keys[0], "CBF/conv1_a/weights");
        assert_eq!(keys[8], "CBF/fullcn/weights");
        assert_eq!(keys[11], "CBF/logits/biases");
    }

    #[test]
    fn test_paper_classifier_head_width() {
        let config = TrainConfig::new(
            6,
            VolumeShape::new(91, 109, 91, 1),
            1e-4,
            1,
            2,
            vec!["T1_brain".to_string()],
            "/tmp/c",
        )
        .unwrap();
        let classifier = ClassifierConfig::from_train_config("T1_brain", &config);

        assert_eq!(classifier.head_config().unwrap().d_input, 512);
    }

    #[test]
    fn test_channel_mismatch_is_rejected() {
        let device = Default::default();
        let config = ClassifierConfig::new(
            "DTI_FA".to_string(),
            VolumeShape::new(8, 8, 8, 2),
            tiny_tower(),
            5,
            2,
        );

        assert!(matches!(
            config.init::<TestBackend>(&device),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_model_config_json_is_tagged() {
        let classifier = ModelConfig::Classifier(tiny_classifier("CBF"));
        let fusion = ModelConfig::Fusion(FusionConfig {
            towers: ["CBF", "T1_brain"]
                .into_iter()
                .map(|m| TowerSource {
                    modality: m.to_string(),
                    dir: PathBuf::from("checkpoints").join(m),
                    step: 12,
                })
                .collect(),
            head: FusionHeadConfig::for_towers(
                FusionLayer::Conv7,
                &tiny_tower(),
                [8, 8, 8],
                2,
                5,
                2,
            )
            .unwrap(),
        });

        for config in [classifier, fusion] {
            let json = serde_json::to_string(&config).unwrap();
            assert!(json.contains("\"kind\""));
            let back: ModelConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(back, config);
        }
    }
}
