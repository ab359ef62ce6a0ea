#![recursion_limit = "256"]

use clap::{Parser, Subcommand};
use dementia_fusion::backend::{Backend, InnerBackend, default_device};
use dementia_fusion::config::{LogLevel, Settings, Var};
use dementia_fusion::core::head::FusionLayer;
use dementia_fusion::core::pipeline::{self, RunConfig, Variant};
use dementia_fusion::inference::InferenceEngine;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::instrument;

#[derive(Debug, Parser)]
#[command(
    name = "dementia-fusion",
    version,
    about = "Multimodal 3D CNN training and feature fusion for dementia progression"
)]
struct Args {
    /// JSON parameter file. Falls back to FUSION_PARAMS
    #[arg(long, global = true)]
    params: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train a single-modality classifier from scratch
    Pretrain {
        #[arg(long)]
        modality: String,
    },
    /// Train a fusion head on frozen features of every configured modality
    Fuse {
        /// Overrides `fusion_layer` of the parameter file
        #[arg(long)]
        layer: Option<FusionLayer>,
    },
    /// Restore a pretrained tower and retrain the dense layers on the configured modality
    Finetune {
        /// Checkpoint directory of the source classifier
        #[arg(long)]
        source: PathBuf,
        /// Exclude restored layers from updates
        #[arg(long)]
        freeze: bool,
    },
    /// Evaluate the latest checkpoint of a run on the validation split
    Evaluate {
        /// Checkpoint directory of the run
        #[arg(long)]
        run: PathBuf,
        /// Input modalities, when they differ from the ones recorded with the model
        #[arg(long, value_delimiter = ',')]
        modalities: Vec<String>,
    },
    /// Print class probabilities for volume files
    Predict {
        /// Checkpoint directory of a single-modality classifier
        #[arg(long)]
        run: PathBuf,
        #[arg(required = true)]
        volumes: Vec<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct Prediction {
    file: PathBuf,
    probabilities: Vec<f32>,
}

fn main() {
    let level = match LogLevel::from_env() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // Log diagnostics to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .pretty()
        .with_max_level(level)
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(params: Option<PathBuf>) -> anyhow::Result<RunConfig> {
    let settings = Settings::from_env(params)?;
    Ok(settings.run_config()?)
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut layer_override = None;

    let variant = match args.command {
        Command::Predict { run, volumes } => return predict(run, &volumes),
        Command::Evaluate { run, modalities } => {
            let config = load_config(args.params)?;
            let modalities = (!modalities.is_empty()).then_some(modalities);
            return evaluate(&config, run, modalities);
        }
        Command::Pretrain { modality } => Variant::Pretrain { modality },
        Command::Fuse { layer } => {
            layer_override = layer;
            Variant::Fusion
        }
        Command::Finetune { source, freeze } => Variant::FineTune {
            source,
            freeze_pretrained: freeze,
        },
    };

    let mut config = load_config(args.params)?;
    if let Some(layer) = layer_override {
        config.cnn.fusion_layer = layer;
    }
    train(&config, variant)
}

#[instrument(level = "info", skip(config))]
fn train(config: &RunConfig, variant: Variant) -> anyhow::Result<()> {
    let device = default_device();
    let report = pipeline::run::<Backend>(config, &variant, &device)?;

    if let Some(last) = report.epochs.last() {
        tracing::info!(
            steps = report.steps,
            train_accuracy = last.train.patient_accuracy,
            valid_accuracy = last.valid.patient_accuracy,
            checkpoint = ?last.checkpoint,
            "Training finished"
        );
    }
    Ok(())
}

#[instrument(level = "info", skip(config))]
fn evaluate(
    config: &RunConfig,
    run: PathBuf,
    modalities: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let device = default_device();
    let (report, step) =
        pipeline::evaluate_checkpoint::<InnerBackend>(config, &run, modalities, &device)?;

    println!(
        "step {step}: patient accuracy {:.4} ({} patients), sample accuracy {:.4}",
        report.patient_accuracy, report.patients, report.sample_accuracy
    );
    Ok(())
}

#[instrument(level = "info")]
fn predict(run: PathBuf, volumes: &[PathBuf]) -> anyhow::Result<()> {
    let device = default_device();
    let engine = InferenceEngine::<InnerBackend>::load(&run, &device)?;
    let mut stdout = io::stdout().lock();

    for file in volumes {
        let probabilities = engine.predict_file(file)?;
        let line = serde_json::to_string(&Prediction {
            file: file.clone(),
            probabilities,
        })?;
        writeln!(stdout, "{line}")?;
    }
    stdout.flush()?;
    Ok(())
}
