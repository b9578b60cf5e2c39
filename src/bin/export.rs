#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::{config::Config, module::Module, record::CompactRecorder};
use clap::Parser;
use pix2pixhd_burn::checkpoint::CheckpointStore;
use pix2pixhd_burn::config::TrainingConfig;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

type ExportBackend = burn::backend::NdArray<f32>;

#[derive(Parser, Debug)]
#[command(about = "Export the smoothed generator of a training checkpoint")]
struct Args {
    /// Checkpoint file, or a checkpoint directory to take the newest one from.
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long, default_value = "generator")]
    model_name: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let device = Default::default();

    let checkpoint = CheckpointStore::resolve(&args.checkpoint)
        .with_context(|| format!("no checkpoint found at {}", args.checkpoint.display()))?;
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => checkpoint
            .parent()
            .map(|dir| dir.join("config.json"))
            .context("checkpoint has no parent directory; pass --config")?,
    };
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config in {}", config_path.display()))?;

    let generator = CheckpointStore::load_generator::<ExportBackend, _>(
        &checkpoint,
        config.model.init_generator::<ExportBackend>(&device),
        &device,
    )
    .with_context(|| format!("failed to load generator from {}", checkpoint.display()))?;

    fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;
    let save_path = args.save_dir.join(&args.model_name);
    generator
        .save_file(save_path.clone(), &CompactRecorder::new())
        .with_context(|| format!("failed to save {}", save_path.display()))?;
    config
        .model
        .save(args.save_dir.join("model_config.json"))
        .context("failed to save model config")?;

    info!(path = %save_path.display(), "exported generator");
    Ok(())
}
