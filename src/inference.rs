use crate::core::batcher::VolumeBatcher;
use crate::core::checkpoint::CheckpointDir;
use crate::core::dataset::VolumeItem;
use crate::core::ingestion::{RawVolumeReader, VolumeReader};
use crate::core::layers::LossCollection;
use crate::core::model::{Classifier, ClassifierConfig, ModelConfig, VolumeClassifier};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn::tensor::activation::softmax;
use std::path::Path;

pub struct InferenceEngine<B: Backend> {
    pub model: Classifier<B>,
    pub config: ClassifierConfig,
    step: usize,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// Load the latest classifier checkpoint and its config from `dir`
    pub fn load(dir: &Path, device: &B::Device) -> anyhow::Result<Self> {
        let checkpoints = CheckpointDir::new(dir, None);

        let config = match checkpoints.load_config::<ModelConfig>()? {
            ModelConfig::Classifier(config) => config,
            ModelConfig::Fusion(_) => {
                anyhow::bail!("{} holds a fusion head, expected a classifier", dir.display())
            }
        };

        let model = config.init::<B>(device)?;
        let (model, step) = checkpoints.load_latest(model, device)?;

        Ok(Self {
            model,
            config,
            step,
            device: device.clone(),
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Class probabilities for one channel-last volume
    pub fn predict(&self, volume: Vec<f32>) -> anyhow::Result<Vec<f32>> {
        let expected = self.config.volume.len();
        if volume.len() != expected {
            anyhow::bail!("volume holds {} values, expected {}", volume.len(), expected);
        }

        let item = VolumeItem {
            patient: String::new(),
            volumes: vec![volume],
            label: 0, // unused at inference
        };
        let batcher = VolumeBatcher::<B>::new(self.config.volume);
        let batch = batcher.batch(vec![item], &self.device);
        let input = batch
            .volumes
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty batch"))?;

        let logits = self
            .model
            .forward(input, &mut LossCollection::detached());
        let probabilities = softmax(logits, 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to convert tensor to vec: {:?}", e))?;

        Ok(probabilities)
    }

    pub fn predict_file(&self, path: &Path) -> anyhow::Result<Vec<f32>> {
        let volume = RawVolumeReader.read(path, &self.config.volume)?;
        self.predict(volume)
    }
}
