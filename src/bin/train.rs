#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use clap::Parser;
use pix2pixhd_burn::config::TrainingConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
type Backend = burn_cuda::Cuda<f32, i32>;
#[cfg(not(feature = "cuda"))]
type Backend = burn::backend::Wgpu<f32, i32>;

#[derive(Parser, Debug)]
#[command(about = "Train a pix2pixHD translator with Burn")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    experiment_dir: PathBuf,
    /// Checkpoint to resume from; training restarts at the epoch in its name.
    #[arg(long)]
    resume_from: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let device = Default::default();
    pix2pixhd_burn::training::train::<Autodiff<Backend>>(
        &args.experiment_dir,
        config,
        args.resume_from.as_deref(),
        device,
    )
    .with_context(|| format!("training in {} failed", args.experiment_dir.display()))?;
    Ok(())
}
