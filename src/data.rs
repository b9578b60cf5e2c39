use crate::error::{Result, TrainError};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Source image path and the target image it is paired with by file name.
#[derive(Debug, Clone)]
pub struct ImagePair {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// A batch of normalized source images and their ground-truth targets.
#[derive(Clone, Debug)]
pub struct PairBatch<B: Backend> {
    pub input: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
}

impl<B: Backend> PairBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.input.dims()[0]
    }
}

/// Settings for decoding and assembling image batches.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub image_size: u32,
    pub flip_probability: f64,
}

/// `root/split/{source_folder,target_folder}` pairs matched by file name.
#[derive(Clone, Debug)]
pub struct PairedImageDataset {
    pairs: Vec<ImagePair>,
}

impl PairedImageDataset {
    /// Index a split, skipping (and logging) sources without a target.
    pub fn open(root: &Path, split: &str, source_folder: &str, target_folder: &str) -> Result<Self> {
        let source_dir = root.join(split).join(source_folder);
        let target_dir = root.join(split).join(target_folder);
        if !source_dir.is_dir() {
            return Err(TrainError::DataUnavailable { path: source_dir });
        }

        let pattern = format!("{}/*", glob::Pattern::escape(&source_dir.to_string_lossy()));
        let mut sources: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|err| TrainError::Configuration(format!("bad dataset pattern: {err}")))?
            .filter_map(std::result::Result::ok)
            .filter(|path| is_image(path))
            .collect();
        sources.sort();

        let mut pairs = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = target_dir.join(name);
            if target.is_file() {
                pairs.push(ImagePair { source, target });
            } else {
                let err = TrainError::DataUnavailable { path: target };
                warn!(%err, "skipping unpaired sample");
            }
        }

        info!(split, pairs = pairs.len(), "indexed dataset split");
        Ok(Self { pairs })
    }

    pub fn from_pairs(pairs: Vec<ImagePair>) -> Self {
        Self { pairs }
    }
}

impl Dataset<ImagePair> for PairedImageDataset {
    fn get(&self, index: usize) -> Option<ImagePair> {
        self.pairs.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decodes pairs into tensors; yields `None` when no pair of the batch decodes.
#[derive(Clone)]
pub struct PairBatcher {
    config: DataConfig,
    augment: bool,
    rng: Arc<Mutex<StdRng>>,
}

impl PairBatcher {
    pub fn new(config: DataConfig, augment: bool, seed: u64) -> Self {
        Self {
            config,
            augment,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, ImagePair, Option<PairBatch<B>>> for PairBatcher {
    fn batch(&self, items: Vec<ImagePair>, device: &B::Device) -> Option<PairBatch<B>> {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        build_batch(&items, &self.config, self.augment, &mut *rng, device)
    }
}

/// Build a normalized batch, skipping pairs that fail to decode.
pub fn build_batch<B: Backend>(
    pairs: &[ImagePair],
    config: &DataConfig,
    augment: bool,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Option<PairBatch<B>> {
    let size = config.image_size as usize;
    let mut inputs = Vec::with_capacity(pairs.len() * 3 * size * size);
    let mut targets = Vec::with_capacity(pairs.len() * 3 * size * size);
    let mut count = 0;

    for pair in pairs {
        let (mut source, mut target) = match load_pair(pair, config.image_size) {
            Ok(images) => images,
            Err(err) => {
                warn!(%err, source = %pair.source.display(), "skipping undecodable sample");
                continue;
            }
        };
        if augment && rng.gen_bool(config.flip_probability) {
            source = image::imageops::flip_horizontal(&source);
            target = image::imageops::flip_horizontal(&target);
        }
        inputs.append(&mut image_to_chw(&source));
        targets.append(&mut image_to_chw(&target));
        count += 1;
    }

    if count == 0 {
        return None;
    }

    let shape = [count, 3, size, size];
    Some(PairBatch {
        input: Tensor::from_data(TensorData::new(inputs, shape), device),
        target: Tensor::from_data(TensorData::new(targets, shape), device),
    })
}

fn load_pair(pair: &ImagePair, size: u32) -> Result<(RgbImage, RgbImage)> {
    Ok((load_image(&pair.source, size)?, load_image(&pair.target, size)?))
}

/// Decode an image as RGB and resize it to `size x size`.
pub fn load_image(path: &Path, size: u32) -> Result<RgbImage> {
    let img = image::open(path)?.to_rgb8();
    if img.width() == size && img.height() == size {
        return Ok(img);
    }
    Ok(image::imageops::resize(
        &img,
        size,
        size,
        image::imageops::FilterType::Triangle,
    ))
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
        out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
        out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
    }

    out
}

pub type PairLoader<B> = Arc<dyn DataLoader<B, Option<PairBatch<B>>>>;

/// Shuffled loader with a bounded pool of prefetching workers.
pub fn build_loader<B: Backend>(
    dataset: PairedImageDataset,
    config: DataConfig,
    augment: bool,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
    device: &B::Device,
) -> PairLoader<B> {
    let batcher = PairBatcher::new(config, augment, seed);
    DataLoaderBuilder::<B, ImagePair, Option<PairBatch<B>>>::new(batcher)
        .batch_size(batch_size)
        .shuffle(seed)
        .num_workers(num_workers)
        .set_device(device.clone())
        .build(dataset)
}

/// Anything the trainer can draw one epoch of batches from.
pub trait BatchSource<B: Backend> {
    fn batches(&self) -> Box<dyn Iterator<Item = PairBatch<B>> + '_>;
}

impl<B: Backend> BatchSource<B> for Vec<PairBatch<B>> {
    fn batches(&self) -> Box<dyn Iterator<Item = PairBatch<B>> + '_> {
        Box::new(self.iter().cloned())
    }
}

impl<B: Backend> BatchSource<B> for PairLoader<B> {
    fn batches(&self) -> Box<dyn Iterator<Item = PairBatch<B>> + '_> {
        Box::new(self.iter().flatten())
    }
}

/// Provider of the held-out batch rendered at each sampling event.
pub trait SampleSource<B: Backend> {
    fn sample(&self) -> Option<PairBatch<B>>;
}

impl<B: Backend> SampleSource<B> for Vec<PairBatch<B>> {
    fn sample(&self) -> Option<PairBatch<B>> {
        self.first().cloned()
    }
}

impl<B: Backend> SampleSource<B> for PairLoader<B> {
    fn sample(&self) -> Option<PairBatch<B>> {
        self.iter().flatten().next()
    }
}
