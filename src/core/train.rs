use super::batcher::VolumeBatcher;
use super::checkpoint::CheckpointDir;
use super::dataset::VolumeDataset;
use super::evaluator::{EvalReport, evaluate, predicted_classes};
use super::layers::LossCollection;
use super::model::VolumeClassifier;
use super::schedule::LearningRateSchedule;
use super::summary::{SummaryEvent, SummaryWriter};
use super::train_config::TrainConfig;
use crate::core::Error;
use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Turns the per-modality volumes of a batch into the model input.
pub trait FeatureSource<B: Backend> {
    /// Number of volumes expected per sample
    fn arity(&self) -> usize;

    fn features(&self, volumes: Vec<Tensor<B, 5>>) -> Result<Tensor<B, 5>, Error>;
}

/// Feeds the single input volume straight to a model that owns its tower.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveInput;

impl<B: Backend> FeatureSource<B> for LiveInput {
    fn arity(&self) -> usize {
        1
    }

    fn features(&self, volumes: Vec<Tensor<B, 5>>) -> Result<Tensor<B, 5>, Error> {
        let count = volumes.len();
        match volumes.into_iter().next() {
            Some(volume) if count == 1 => Ok(volume),
            _ => Err(Error::shape_mismatch("modality inputs", &[1], &[count])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BuildGraph,
    Initialize,
    TrainStep,
    Evaluate,
    Checkpoint,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BuildGraph => "build_graph",
            Phase::Initialize => "initialize",
            Phase::TrainStep => "train_step",
            Phase::Evaluate => "evaluate",
            Phase::Checkpoint => "checkpoint",
            Phase::Finalize => "finalize",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
struct PhaseTracker {
    current: Option<Phase>,
}

impl PhaseTracker {
    fn enter(&mut self, phase: Phase, step: usize) {
        if self.current != Some(phase) {
            tracing::debug!(phase = %phase, step, "Entering phase");
            self.current = Some(phase);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLoss {
    pub total: f32,
    pub cross_entropy: f32,
    pub weight_decay: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub step: usize,
    pub train: EvalReport,
    pub valid: EvalReport,
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub steps: usize,
    pub steps_per_epoch: usize,
    pub epochs: Vec<EpochReport>,
}

/// Run a single training batch through forward, backward, and optimizer step.
/// Fails with `Diverged` before any update when the loss is NaN.
fn process_training_batch<B, M, O>(
    model: M,
    optimizer: &mut O,
    loss_fn: &CrossEntropyLoss<B>,
    features: Tensor<B, 5>,
    targets: Tensor<B, 1, Int>,
    learning_rate: f64,
    step: usize,
) -> Result<(M, StepLoss), Error>
where
    B: AutodiffBackend,
    M: VolumeClassifier<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let device = features.device();
    let mut losses = LossCollection::new();

    let logits = model.forward(features, &mut losses);
    let cross_entropy = loss_fn.forward(logits, targets);
    let weight_decay = losses.total(&device);
    let loss = cross_entropy.clone() + weight_decay.clone();

    let step_loss = StepLoss {
        total: loss.clone().into_scalar().elem::<f32>(),
        cross_entropy: cross_entropy.into_scalar().elem::<f32>(),
        weight_decay: weight_decay.into_scalar().elem::<f32>(),
    };
    if step_loss.total.is_nan() {
        tracing::error!(step, "Model diverged with loss = NaN");
        return Err(Error::Diverged { step });
    }

    let grads = loss.backward();
    let grads_params = GradientsParams::from_grads(grads, &model);
    let updated_model = optimizer.step(learning_rate, model, grads_params);

    Ok((updated_model, step_loss))
}

/// Evaluates on both splits with freshly rewound cursors and rewinds them again afterwards.
fn evaluate_splits<B, M, S>(
    model: &M,
    source: &S,
    train: &mut VolumeDataset,
    valid: &mut VolumeDataset,
    batcher: &VolumeBatcher<B>,
    device: &B::Device,
) -> Result<(EvalReport, EvalReport), Error>
where
    B: Backend,
    M: VolumeClassifier<B>,
    S: FeatureSource<B>,
{
    train.rewind();
    valid.rewind();
    let train_report = evaluate(model, source, train, batcher, device)?;
    let valid_report = evaluate(model, source, valid, batcher, device)?;
    train.rewind();
    valid.rewind();
    Ok((train_report, valid_report))
}

fn log_evaluation(
    summary: &mut SummaryWriter,
    split: &str,
    step: usize,
    epoch: usize,
    report: &EvalReport,
) -> Result<(), Error> {
    tracing::info!(
        split,
        step,
        epoch,
        patient_accuracy = report.patient_accuracy,
        sample_accuracy = report.sample_accuracy,
        cross_entropy = report.cross_entropy,
        patients = report.patients,
        "Evaluation completed",
    );
    summary.write(SummaryEvent::Evaluation {
        step,
        epoch,
        split: split.to_string(),
        patient_accuracy: report.patient_accuracy,
        sample_accuracy: report.sample_accuracy,
        cross_entropy: report.cross_entropy,
    })
}

/// Trains `model` on features produced by `source`.
///
/// An epoch is `train.num_steps()` updates. At every epoch boundary and after the last step
/// both splits are evaluated and a checkpoint is written.
#[allow(clippy::too_many_arguments)]
pub fn train<B, M, S>(
    device: &B::Device,
    mut model: M,
    source: &S,
    train: &mut VolumeDataset,
    valid: &mut VolumeDataset,
    config: &TrainConfig,
    checkpoints: &CheckpointDir,
    summary: &mut SummaryWriter,
) -> Result<(M, RunReport), Error>
where
    B: AutodiffBackend,
    M: VolumeClassifier<B> + AutodiffModule<B>,
    M::InnerModule: VolumeClassifier<B::InnerBackend>,
    S: FeatureSource<B::InnerBackend>,
{
    let mut phase = PhaseTracker { current: None };
    phase.enter(Phase::BuildGraph, 0);

    let steps_per_epoch = train.num_steps();
    let num_steps = steps_per_epoch * config.num_epochs;
    let schedule = LearningRateSchedule::from_config(config, steps_per_epoch);
    let batcher = VolumeBatcher::<B::InnerBackend>::new(config.volume);
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    tracing::info!(
        modalities = source.arity(),
        train_sizes = ?train.class_sizes(),
        valid_sizes = ?valid.class_sizes(),
        steps_per_epoch,
        num_steps,
        "Training started",
    );

    phase.enter(Phase::Initialize, 0);
    let mut optimizer = AdamConfig::new().init::<B, M>();
    let mut epochs = Vec::new();

    for step in 1..=num_steps {
        phase.enter(Phase::TrainStep, step);
        let global_step = step - 1;
        let epoch = global_step / steps_per_epoch + 1;
        let learning_rate = schedule.rate_at(global_step);
        let started = Instant::now();

        let batch = batcher.batch(train.next_batch()?, device);
        let features = source.features(batch.volumes)?;
        if step == 1 {
            model.check_input(features.dims())?;
        }
        let probe = (step % config.log_every == 0).then(|| features.clone());

        let (updated_model, loss) = process_training_batch(
            model,
            &mut optimizer,
            &loss_fn,
            Tensor::from_inner(features),
            Tensor::from_inner(batch.targets),
            learning_rate,
            step,
        )?;
        model = updated_model;

        summary.write(SummaryEvent::Step {
            step,
            loss: loss.total,
            cross_entropy: loss.cross_entropy,
            weight_decay: loss.weight_decay,
            learning_rate,
        })?;

        if let Some(features) = probe {
            let predicted = predicted_classes(
                model
                    .valid()
                    .forward(features, &mut LossCollection::detached()),
            );
            let hits = predicted
                .iter()
                .zip(&batch.labels)
                .filter(|(p, l)| p == l)
                .count();
            let accuracy = hits as f32 / batch.labels.len().max(1) as f32;
            let seconds = started.elapsed().as_secs_f64();
            let examples_per_sec = batch.labels.len() as f64 / seconds.max(f64::EPSILON);

            tracing::info!(
                step,
                epoch,
                loss = loss.total,
                cross_entropy = loss.cross_entropy,
                weight_decay = loss.weight_decay,
                accuracy,
                learning_rate,
                examples_per_sec,
                sec_per_batch = seconds,
                "Training batch",
            );
            summary.write(SummaryEvent::BatchAccuracy {
                step,
                accuracy,
                examples_per_sec,
            })?;
        }

        if step % steps_per_epoch == 0 || step == num_steps {
            phase.enter(Phase::Evaluate, step);
            let valid_model = model.valid();
            let (train_report, valid_report) =
                evaluate_splits(&valid_model, source, train, valid, &batcher, device)?;
            log_evaluation(summary, train.name(), step, epoch, &train_report)?;
            log_evaluation(summary, valid.name(), step, epoch, &valid_report)?;

            phase.enter(Phase::Checkpoint, step);
            let path = checkpoints.save(&model, step, model.param_entries())?;
            summary.flush()?;

            tracing::info!(
                epoch,
                total_epochs = config.num_epochs,
                train_accuracy = train_report.patient_accuracy,
                valid_accuracy = valid_report.patient_accuracy,
                "Epoch completed",
            );

            epochs.push(EpochReport {
                epoch,
                step,
                train: train_report,
                valid: valid_report,
                checkpoint: path,
            });
        }
    }

    phase.enter(Phase::Finalize, num_steps);
    summary.flush()?;

    Ok((
        model,
        RunReport {
            steps: num_steps,
            steps_per_epoch,
            epochs,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::TailPolicy;
    use crate::core::dataset::tests::{LabelReader, partitions};
    use crate::core::ingestion::{self, VolumeReader, VolumeShape};
    use crate::core::model::tests::tiny_classifier;
    use crate::core::model::{Classifier, ClassifierConfig};
    use crate::core::summary::SummaryRecord;
    use approx::assert_relative_eq;
    use burn::backend::{Autodiff, NdArray};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    struct NanReader;

    impl VolumeReader for NanReader {
        fn read(&self, _path: &Path, shape: &VolumeShape) -> Result<Vec<f32>, ingestion::Error> {
            Ok(vec![f32::NAN; shape.len()])
        }
    }

    fn shape() -> VolumeShape {
        VolumeShape::new(8, 8, 8, 1)
    }

    fn dataset(name: &str, sizes: &[usize], reader: Box<dyn VolumeReader>) -> VolumeDataset {
        VolumeDataset::new(
            name,
            partitions(sizes, 1),
            shape(),
            2,
            TailPolicy::Wrap,
            reader,
            11,
        )
        .unwrap()
    }

    fn config(root: &Path, epochs: usize) -> TrainConfig {
        TrainConfig::new(2, shape(), 1e-3, epochs, 2, vec!["CBF".to_string()], root)
            .unwrap()
            .with_log_every(2)
            .unwrap()
            .with_summary_path(root.join("summary.jsonl"))
    }

    fn summary_records(path: &Path) -> Vec<SummaryRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_live_input_requires_one_volume() {
        let device = Default::default();
        let volume = Tensor::<NdArray<f32>, 5>::ones([1, 1, 2, 2, 2], &device);

        assert!(FeatureSource::<NdArray<f32>>::features(&LiveInput, vec![volume.clone()]).is_ok());
        assert!(
            FeatureSource::<NdArray<f32>>::features(&LiveInput, vec![volume.clone(), volume])
                .is_err()
        );
    }

    #[test]
    fn test_checkpoints_every_epoch_and_rewinds_datasets() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let config = config(root.path(), 2);
        let checkpoints = CheckpointDir::new(root.path().join("run"), None);
        let mut summary = SummaryWriter::from_path(config.summary_path.as_deref()).unwrap();
        let mut train_ds = dataset("train", &[4, 2], Box::new(LabelReader));
        let mut valid_ds = dataset("valid", &[2, 2], Box::new(LabelReader));
        let model = tiny_classifier("CBF").init::<TestBackend>(&device).unwrap();

        let (_, report) = train(
            &device,
            model,
            &LiveInput,
            &mut train_ds,
            &mut valid_ds,
            &config,
            &checkpoints,
            &mut summary,
        )
        .unwrap();

        assert_eq!(report.steps_per_epoch, 4);
        assert_eq!(report.steps, 8);
        assert_eq!(report.epochs.len(), 2);
        assert_eq!(report.epochs[0].step, 4);
        assert_eq!(report.epochs[1].epoch, 2);
        assert_eq!(report.epochs[0].valid.patients, 4);
        assert_eq!(report.epochs[0].train.patients, 6);
        assert_eq!(checkpoints.manifest().unwrap().steps, vec![4, 8]);
        assert_eq!(train_ds.cursor(0), Some(0));
        assert_eq!(valid_ds.cursor(1), Some(0));

        let records = summary_records(&root.path().join("summary.jsonl"));
        let steps = records
            .iter()
            .filter(|r| matches!(r.event, SummaryEvent::Step { .. }))
            .count();
        let probes = records
            .iter()
            .filter(|r| matches!(r.event, SummaryEvent::BatchAccuracy { .. }))
            .count();
        assert_eq!(steps, 8);
        assert_eq!(probes, 4);
    }

    #[test]
    fn test_staircase_decay_across_epochs() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let config = config(root.path(), 4).with_lr_decay(0.5, 1).unwrap();
        let checkpoints = CheckpointDir::new(root.path().join("run"), Some(1));
        let mut summary = SummaryWriter::from_path(config.summary_path.as_deref()).unwrap();
        let mut train_ds = dataset("train", &[2, 2], Box::new(LabelReader));
        let mut valid_ds = dataset("valid", &[1, 1], Box::new(LabelReader));
        let model = tiny_classifier("CBF").init::<TestBackend>(&device).unwrap();

        train(
            &device,
            model,
            &LiveInput,
            &mut train_ds,
            &mut valid_ds,
            &config,
            &checkpoints,
            &mut summary,
        )
        .unwrap();

        let rates: Vec<f64> = summary_records(&root.path().join("summary.jsonl"))
            .into_iter()
            .filter_map(|r| match r.event {
                SummaryEvent::Step { learning_rate, .. } => Some(learning_rate),
                _ => None,
            })
            .collect();
        let lr0 = 1e-3;
        assert_eq!(rates.len(), 8);
        assert_relative_eq!(rates[0], lr0, max_relative = 1e-12);
        assert_relative_eq!(rates[1], lr0, max_relative = 1e-12);
        assert_relative_eq!(rates[2], lr0 * 0.5, max_relative = 1e-12);
        assert_relative_eq!(rates[6], lr0 * 0.5f64.powi(3), max_relative = 1e-12);
        assert_relative_eq!(rates[7], lr0 * 0.5f64.powi(3), max_relative = 1e-12);
        assert_eq!(checkpoints.manifest().unwrap().steps, vec![8]);
    }

    fn step_loss(config: &ClassifierConfig) -> StepLoss {
        let device = Default::default();
        let model = config.init::<TestBackend>(&device).unwrap();
        let mut optimizer = AdamConfig::new().init::<TestBackend, Classifier<TestBackend>>();
        let loss_fn = CrossEntropyLossConfig::new().init(&device);
        let features = Tensor::<TestBackend, 5>::ones([2, 1, 8, 8, 8], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let (_, loss) =
            process_training_batch(model, &mut optimizer, &loss_fn, features, targets, 1e-3, 1)
                .unwrap();
        loss
    }

    #[test]
    fn test_total_loss_adds_collected_weight_decay() {
        let base = tiny_classifier("CBF");
        let config = ClassifierConfig {
            tower: base.tower.clone().with_decay(0.01),
            ..base
        }
        .with_decay(0.01);

        let loss = step_loss(&config);

        assert!(loss.weight_decay > 0.0);
        assert_relative_eq!(loss.total, loss.cross_entropy + loss.weight_decay, epsilon = 1e-5);
    }

    #[test]
    fn test_zero_decay_leaves_cross_entropy() {
        let loss = step_loss(&tiny_classifier("CBF"));

        assert_eq!(loss.weight_decay, 0.0);
        assert_relative_eq!(loss.total, loss.cross_entropy, epsilon = 1e-6);
    }

    #[test]
    fn test_nan_loss_aborts_without_checkpoint() {
        let root = TempDir::new().unwrap();
        let device = Default::default();
        let config = config(root.path(), 1);
        let checkpoints = CheckpointDir::new(root.path().join("run"), None);
        let mut summary = SummaryWriter::disabled();
        let mut train_ds = dataset("train", &[2, 2], Box::new(NanReader));
        let mut valid_ds = dataset("valid", &[1, 1], Box::new(LabelReader));
        let model = tiny_classifier("CBF").init::<TestBackend>(&device).unwrap();

        let result = train(
            &device,
            model,
            &LiveInput,
            &mut train_ds,
            &mut valid_ds,
            &config,
            &checkpoints,
            &mut summary,
        );

        assert!(matches!(result, Err(Error::Diverged { step: 1 })));
        assert!(!checkpoints.exists());
        assert!(!checkpoints.model_path(1).exists());
    }
}
