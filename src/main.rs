//! CTC acoustic model trainer.
//!
//! This is the entry point for training. It assembles the configuration, sets
//! up logging, loads the vocabulary and manifests, builds the encoder (fresh
//! or from a checkpoint) and runs the epoch loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use amira_asr_trainer::{
    asr::Vocabulary,
    backend::{backend_from_name, TensorBackend},
    config::{ConfigOverrides, TrainConfig},
    constants::audio::FEATURE_DIM,
    data::{BatchLoader, LoaderOptions, ManifestDataset},
    model::{CtcLoss, GatedConvEncoder, GatedConvOptions},
    telemetry::{init_tracing, MetricsWriter, TracingConfig},
    train::Trainer,
};

#[derive(Debug, Parser)]
#[command(name = "amira-asr-trainer")]
#[command(author, version, about = "Train a CTC speech recognition model", long_about = None)]
struct Cli {
    /// TOML or YAML config file; defaults to amira-trainer.toml / .yaml if present
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TrainConfig::load(cli.config.as_deref(), &cli.overrides)?;

    init_tracing(&TracingConfig {
        log_level: config.log_level.clone(),
        format: config.log_format,
    })?;

    println!("----------- Configuration -----------");
    print!("{}", config.dump(cli.config.as_deref())?);
    println!("-------------------------------------");

    std::fs::create_dir_all(&config.save_model_path).with_context(|| {
        format!(
            "creating output directory {}",
            config.save_model_path.display()
        )
    })?;

    info!("Loading vocabulary from {}", config.vocab_path.display());
    let vocabulary = Arc::new(Vocabulary::load_from_file(&config.vocab_path)?);
    info!("Loaded vocabulary with {} tokens", vocabulary.len());

    let loader_options = LoaderOptions {
        batch_size: config.batch_size,
        num_workers: config.num_workers,
        prefetch: config.prefetch,
        seed: config.seed,
    };
    let train_set = ManifestDataset::load(&config.train_manifest_path, vocabulary.clone())?;
    let dev_set = ManifestDataset::load(&config.dev_manifest_path, vocabulary.clone())?;
    info!(
        "Train manifest: {} utterances, dev manifest: {} utterances",
        train_set.entries().len(),
        dev_set.entries().len()
    );
    let train = BatchLoader::new(Arc::new(train_set), loader_options.clone())?;
    let dev = BatchLoader::new(Arc::new(dev_set), loader_options)?;

    let backend: Arc<dyn TensorBackend> = Arc::from(backend_from_name(&config.backend)?);
    info!("Using {} backend", backend.name());

    let mut model = GatedConvEncoder::new(GatedConvOptions {
        in_channels: FEATURE_DIM,
        num_classes: vocabulary.len(),
        kernel_size: config.kernel_size,
        dropout: config.dropout,
        seed: config.seed,
    })?;

    let mut trainer = Trainer::new(
        &config,
        vocabulary,
        backend,
        Box::new(CtcLoss::default()),
    )?;
    if let Some(path) = &config.restore_model {
        trainer.resume(path, &mut model)?;
    }

    let mut sink = MetricsWriter::new(&config.save_model_path)?;
    let summaries = trainer.run(&mut model, &train, &dev, &mut sink)?;

    if let Some(last) = summaries.last() {
        info!(
            "Training finished: {} epochs, final CER {:.4}, last checkpoint {}",
            summaries.len(),
            last.cer,
            last.checkpoint.display()
        );
    } else {
        info!("Nothing to train; checkpoint already covers the configured epochs");
    }
    Ok(())
}
