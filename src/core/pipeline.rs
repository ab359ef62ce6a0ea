use crate::core::Error;
use crate::core::batcher::VolumeBatcher;
use crate::core::checkpoint::CheckpointDir;
use crate::core::dataset::{Sample, VolumeDataset};
use crate::core::evaluator::{EvalReport, evaluate};
use crate::core::extractor::FeatureExtractor;
use crate::core::ingestion::{DataPaths, RawVolumeReader, VolumeShape};
use crate::core::model::{Classifier, ClassifierConfig, FusionConfig, ModelConfig, VolumeClassifier};
use crate::core::restore::RestorePlan;
use crate::core::summary::SummaryWriter;
use crate::core::train::{LiveInput, RunReport, train};
use crate::core::train_config::TrainConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything one run needs: the training parameters and where the data lives.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub cnn: TrainConfig,
    pub data: DataPaths,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.cnn.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Train and validation datasets over `modalities`, files in that order.
    pub fn datasets(&self, modalities: &[String]) -> Result<(VolumeDataset, VolumeDataset), Error> {
        let cnn = &self.cnn;
        let index = self.data.index(modalities, cnn.classes)?;

        let train = VolumeDataset::new(
            "train",
            index.train,
            cnn.volume,
            cnn.batch_size,
            cnn.tail_policy,
            Box::new(RawVolumeReader),
            cnn.seed,
        )?;
        let valid = self.valid_dataset_from(index.valid)?;
        Ok((train, valid))
    }

    pub fn valid_dataset(&self, modalities: &[String]) -> Result<VolumeDataset, Error> {
        let index = self.data.index(modalities, self.cnn.classes)?;
        self.valid_dataset_from(index.valid)
    }

    fn valid_dataset_from(&self, partitions: Vec<Vec<Sample>>) -> Result<VolumeDataset, Error> {
        let cnn = &self.cnn;
        VolumeDataset::new(
            "valid",
            partitions,
            cnn.volume,
            cnn.batch_size,
            cnn.tail_policy,
            Box::new(RawVolumeReader),
            cnn.seed.wrapping_add(1),
        )
    }
}

/// Which model a run trains.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    /// Single-modality classifier trained from scratch.
    Pretrain { modality: String },
    /// Fusion head over frozen towers of every configured modality.
    Fusion,
    /// Classifier on the first configured modality whose tower is restored from `source`
    /// and whose dense layers start fresh.
    FineTune {
        source: PathBuf,
        freeze_pretrained: bool,
    },
}

impl Variant {
    /// Name of the checkpoint directory below `checkpoint_path`.
    pub fn run_name(&self, config: &TrainConfig) -> Result<String, Error> {
        Ok(match self {
            Variant::Pretrain { modality } => modality.clone(),
            Variant::Fusion => format!("fusion_{}", config.fusion_layer),
            Variant::FineTune { .. } => format!("{}_finetune", single_modality(config)?),
        })
    }
}

impl ModelConfig {
    /// Modalities whose volumes this model consumes, in input order.
    pub fn input_modalities(&self) -> Vec<String> {
        match self {
            ModelConfig::Classifier(config) => vec![config.modality.clone()],
            ModelConfig::Fusion(config) => config.modalities(),
        }
    }
}

fn single_modality(config: &TrainConfig) -> Result<&String, Error> {
    match config.modalities.as_slice() {
        [modality] => Ok(modality),
        _ => Err(Error::Dataset(format!(
            "fine-tuning trains on exactly one modality, got {:?}",
            config.modalities
        ))),
    }
}

pub fn run_dir(config: &TrainConfig, variant: &Variant) -> Result<PathBuf, Error> {
    Ok(config.checkpoint_path.join(variant.run_name(config)?))
}

/// Builds the model for `variant`, restores what it needs and trains it.
pub fn run<B: AutodiffBackend>(
    config: &RunConfig,
    variant: &Variant,
    device: &B::Device,
) -> Result<RunReport, Error> {
    let cnn = &config.cnn;
    B::seed(device, cnn.seed);

    let checkpoints = CheckpointDir::new(run_dir(cnn, variant)?, cnn.max_to_keep);
    checkpoints.ensure_fresh()?;
    let mut summary = SummaryWriter::from_path(cnn.summary_path.as_deref())?;

    tracing::info!(
        variant = ?variant,
        checkpoint_dir = ?checkpoints.root(),
        "Run started"
    );

    let report = match variant {
        Variant::Pretrain { modality } => {
            let model_config = ClassifierConfig::from_train_config(modality, cnn);
            let model = model_config.init::<B>(device)?;
            checkpoints.save_config(&ModelConfig::Classifier(model_config))?;

            let (mut train_ds, mut valid_ds) = config.datasets(std::slice::from_ref(modality))?;
            let (_, report) = train(
                device,
                model,
                &LiveInput,
                &mut train_ds,
                &mut valid_ds,
                cnn,
                &checkpoints,
                &mut summary,
            )?;
            report
        }
        Variant::Fusion => {
            let extractor = FeatureExtractor::<B::InnerBackend>::open(
                &cnn.modalities,
                |m| cnn.pretrained_dir(m),
                cnn.fusion_layer,
                device,
            )?;
            let head_config = extractor
                .head_config(cnn.hidden_units, cnn.classes)?
                .with_keep_prob(cnn.keep_prob)
                .with_decay(cnn.decay_const);
            let model = head_config.init::<B>(device)?;
            checkpoints.save_config(&ModelConfig::Fusion(FusionConfig {
                towers: extractor.sources(),
                head: head_config,
            }))?;

            let (mut train_ds, mut valid_ds) = config.datasets(&cnn.modalities)?;
            let (_, report) = train(
                device,
                model,
                &extractor,
                &mut train_ds,
                &mut valid_ds,
                cnn,
                &checkpoints,
                &mut summary,
            )?;
            report
        }
        Variant::FineTune {
            source,
            freeze_pretrained,
        } => {
            let modality = single_modality(cnn)?;
            let (model, model_config) =
                restore_for_fine_tuning::<B>(cnn, source, *freeze_pretrained, device)?;
            checkpoints.save_config(&ModelConfig::Classifier(model_config))?;

            let (mut train_ds, mut valid_ds) = config.datasets(std::slice::from_ref(modality))?;
            let (_, report) = train(
                device,
                model,
                &LiveInput,
                &mut train_ds,
                &mut valid_ds,
                cnn,
                &checkpoints,
                &mut summary,
            )?;
            report
        }
    };

    tracing::info!(
        steps = report.steps,
        epochs = report.epochs.len(),
        "Run finished"
    );
    Ok(report)
}

fn load_classifier_config(source: &Path) -> Result<ClassifierConfig, Error> {
    match CheckpointDir::new(source, None).load_config::<ModelConfig>()? {
        ModelConfig::Classifier(config) => Ok(config),
        ModelConfig::Fusion(_) => Err(Error::WrongModel {
            path: source.to_path_buf(),
            expected: "classifier".to_string(),
        }),
    }
}

/// The source tower under its own scope, with a head sized by the run parameters.
fn fine_tune_config(
    cnn: &TrainConfig,
    source: &ClassifierConfig,
) -> Result<ClassifierConfig, Error> {
    if source.volume != cnn.volume {
        let dims = |v: &VolumeShape| [v.depth, v.height, v.width, v.channels];
        return Err(Error::shape_mismatch(
            "fine-tuning volume",
            &dims(&cnn.volume),
            &dims(&source.volume),
        ));
    }

    Ok(ClassifierConfig {
        tower: source.tower.clone().with_decay(cnn.decay_const),
        hidden: cnn.hidden_units,
        classes: cnn.classes,
        keep_prob: cnn.keep_prob,
        decay: cnn.decay_const,
        ..source.clone()
    })
}

/// Restores every tower layer of the classifier in `source`; `fullcn` and `logits` start fresh.
/// Returns the model with the config it was built from.
pub fn restore_for_fine_tuning<B: Backend>(
    cnn: &TrainConfig,
    source: &Path,
    freeze_pretrained: bool,
    device: &B::Device,
) -> Result<(Classifier<B>, ClassifierConfig), Error> {
    let checkpoints = CheckpointDir::new(source, None);
    let manifest = checkpoints.manifest()?;
    let source_config = load_classifier_config(source)?;
    let target_config = fine_tune_config(cnn, &source_config)?;

    let plan = RestorePlan::fine_tune(&target_config, freeze_pretrained);
    let target = target_config.init::<B>(device)?;
    plan.validate(&target.param_entries(), &manifest, source)?;

    let (restored, step) = checkpoints.load_latest(source_config.init::<B>(device)?, device)?;
    tracing::info!(step, path = ?source, freeze_pretrained, "Fine-tuning from checkpoint");

    Ok((plan.apply(target, restored), target_config))
}

/// Restores the latest checkpoint in `dir` and evaluates it on the validation split.
/// `modalities` overrides the inputs recorded with the model.
pub fn evaluate_checkpoint<B: Backend>(
    config: &RunConfig,
    dir: &Path,
    modalities: Option<Vec<String>>,
    device: &B::Device,
) -> Result<(EvalReport, usize), Error> {
    let checkpoints = CheckpointDir::new(dir, None);
    let model_config = checkpoints.load_config::<ModelConfig>()?;
    let inputs = modalities.unwrap_or_else(|| model_config.input_modalities());
    let batcher = VolumeBatcher::<B>::new(config.cnn.volume);
    let mut valid = config.valid_dataset(&inputs)?;

    let (report, step) = match model_config {
        ModelConfig::Classifier(model_config) => {
            let (model, step) = checkpoints.load_latest(model_config.init::<B>(device)?, device)?;
            (evaluate(&model, &LiveInput, &mut valid, &batcher, device)?, step)
        }
        ModelConfig::Fusion(fusion) => {
            let extractor =
                FeatureExtractor::<B>::from_sources(&fusion.towers, fusion.head.layer, device)?;
            let (model, step) = checkpoints.load_latest(fusion.head.init::<B>(device)?, device)?;
            (evaluate(&model, &extractor, &mut valid, &batcher, device)?, step)
        }
    };

    tracing::info!(
        step,
        patient_accuracy = report.patient_accuracy,
        sample_accuracy = report.sample_accuracy,
        patients = report.patients,
        "Checkpoint evaluated"
    );
    Ok((report, step))
}
