use crate::core::Error;
use crate::core::batcher::VolumeBatcher;
use crate::core::dataset::VolumeDataset;
use crate::core::layers::LossCollection;
use crate::core::model::VolumeClassifier;
use crate::core::train::FeatureSource;
use burn::data::dataloader::batcher::Batcher;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use std::collections::HashMap;

/// Correctness per patient. A patient seen several times keeps the last result.
#[derive(Debug, Clone, Default)]
pub struct PatientLedger {
    results: HashMap<String, bool>,
}

impl PatientLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, patient: &str, correct: bool) {
        self.results.insert(patient.to_string(), correct);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn correct(&self) -> usize {
        self.results.values().filter(|c| **c).count()
    }

    /// Correct patients over distinct patients, 0.0 for an empty ledger.
    pub fn accuracy(&self) -> f32 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.correct() as f32 / self.results.len() as f32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub patient_accuracy: f32,
    pub sample_accuracy: f32,
    pub cross_entropy: f32,
    pub weight_decay: f32,
    pub patients: usize,
    pub samples: usize,
}

/// Class index with the highest logit, per row.
pub fn predicted_classes<B: Backend>(logits: Tensor<B, 2>) -> Vec<usize> {
    logits
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .map(|c| c as usize)
        .collect()
}

/// Runs `dataset.num_steps()` batches through `model` without updating anything.
pub fn evaluate<B, M, S>(
    model: &M,
    source: &S,
    dataset: &mut VolumeDataset,
    batcher: &VolumeBatcher<B>,
    device: &B::Device,
) -> Result<EvalReport, Error>
where
    B: Backend,
    M: VolumeClassifier<B>,
    S: FeatureSource<B>,
{
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut ledger = PatientLedger::new();
    let mut samples = 0usize;
    let mut correct = 0usize;
    let mut cross_entropy = 0.0f32;
    let mut weight_decay = 0.0f32;
    let num_steps = dataset.num_steps();

    for _ in 0..num_steps {
        let batch = batcher.batch(dataset.next_batch()?, device);
        let features = source.features(batch.volumes)?;
        model.check_input(features.dims())?;

        let mut losses = LossCollection::new();
        let logits = model.forward(features, &mut losses);
        cross_entropy += loss_fn
            .forward(logits.clone(), batch.targets)
            .into_scalar()
            .elem::<f32>();
        weight_decay += losses.total(device).into_scalar().elem::<f32>();

        for ((patient, label), predicted) in batch
            .patients
            .iter()
            .zip(&batch.labels)
            .zip(predicted_classes(logits))
        {
            let hit = predicted == *label;
            ledger.record(patient, hit);
            samples += 1;
            correct += hit as usize;
        }
    }

    let steps = num_steps.max(1) as f32;
    Ok(EvalReport {
        patient_accuracy: ledger.accuracy(),
        sample_accuracy: if samples > 0 {
            correct as f32 / samples as f32
        } else {
            0.0
        },
        cross_entropy: cross_entropy / steps,
        weight_decay: weight_decay / steps,
        patients: ledger.len(),
        samples,
    })
}
