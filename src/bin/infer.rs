#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use burn::prelude::*;
use burn::tensor::TensorData;
use clap::Parser;
use pix2pixhd_burn::checkpoint::CheckpointStore;
use pix2pixhd_burn::config::TrainingConfig;
use pix2pixhd_burn::data::{image_to_chw, load_image};
use pix2pixhd_burn::model::Generator;
use pix2pixhd_burn::utils::{save_image, tensor_to_images};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
type InferBackend = burn_cuda::Cuda<f32, i32>;
#[cfg(not(feature = "cuda"))]
type InferBackend = burn::backend::Wgpu<f32, i32>;

#[derive(Parser, Debug)]
#[command(about = "Translate a directory of images with a trained generator")]
struct Args {
    /// Checkpoint file, or a checkpoint directory to take the newest one from.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Training config; defaults to `config.json` next to the checkpoint.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input_dir: PathBuf,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let device = Default::default();

    let checkpoint = CheckpointStore::resolve(&args.checkpoint)
        .with_context(|| format!("no checkpoint found at {}", args.checkpoint.display()))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| sibling_config(&checkpoint));
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config in {}", config_path.display()))?;

    let generator = CheckpointStore::load_generator::<InferBackend, _>(
        &checkpoint,
        config.model.init_generator::<InferBackend>(&device),
        &device,
    )
    .with_context(|| format!("failed to load generator from {}", checkpoint.display()))?;

    let mut inputs: Vec<PathBuf> = fs::read_dir(&args.input_dir)
        .with_context(|| format!("failed to read {}", args.input_dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    inputs.sort();
    if inputs.is_empty() {
        return Err(anyhow::anyhow!("no images in {}", args.input_dir.display()));
    }

    fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;
    let image_size = config.model.image_size as u32;
    let mut written = 0usize;
    for chunk in inputs.chunks(args.batch_size.max(1)) {
        written += translate_chunk(&generator, chunk, image_size, &args.save_dir, &device)?;
    }

    info!(written, save_dir = %args.save_dir.display(), "translated images");
    Ok(())
}

/// Translate one chunk of files, skipping those that fail to decode.
fn translate_chunk<B: Backend>(
    generator: &Generator<B>,
    paths: &[PathBuf],
    image_size: u32,
    save_dir: &Path,
    device: &B::Device,
) -> Result<usize> {
    let mut names = Vec::with_capacity(paths.len());
    let mut values = Vec::new();
    for path in paths {
        match load_image(path, image_size) {
            Ok(img) => {
                values.append(&mut image_to_chw(&img));
                names.push(path);
            }
            Err(err) => warn!(%err, path = %path.display(), "skipping undecodable image"),
        }
    }
    if names.is_empty() {
        return Ok(0);
    }

    let size = image_size as usize;
    let input = Tensor::<B, 4>::from_data(TensorData::new(values, [names.len(), 3, size, size]), device);
    let outputs = tensor_to_images(generator.forward(input))?;

    for (path, output) in names.iter().zip(outputs.iter()) {
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let target = save_dir.join(format!("{stem}.png"));
        save_image(output, &target).with_context(|| format!("failed to write {}", target.display()))?;
    }
    Ok(names.len())
}

fn sibling_config(checkpoint: &Path) -> PathBuf {
    checkpoint
        .parent()
        .map(|dir| dir.join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}
