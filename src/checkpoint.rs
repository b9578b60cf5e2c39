use crate::error::{Result, TrainError};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, Record};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CHECKPOINT_EXTENSION: &str = "mpk";

type ItemOf<B, M> = <<M as Module<B>>::Record as Record<B>>::Item<FullPrecisionSettings>;

/// On-disk layout: exactly two named weight blobs.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckpointFile<G, D> {
    #[serde(rename = "G")]
    generator: G,
    #[serde(rename = "D")]
    discriminator: D,
}

/// Append-only directory of `{G, D}` checkpoints.
///
/// Every save produces a new file named after the epoch and the current
/// minute; an existing file is never replaced.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the (smoothed) generator and discriminator weights, returning the new file.
    pub fn save<BG, G, BD, D>(&self, epoch: usize, generator: &G, discriminator: &D) -> Result<PathBuf>
    where
        BG: Backend,
        G: Module<BG>,
        BD: Backend,
        D: Module<BD>,
    {
        fs::create_dir_all(&self.dir)?;
        let checkpoint = CheckpointFile {
            generator: generator.clone().into_record().into_item::<FullPrecisionSettings>(),
            discriminator: discriminator.clone().into_record().into_item::<FullPrecisionSettings>(),
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M").to_string();
        let (path, file) = self.create_unique(epoch, &timestamp)?;
        let mut writer = BufWriter::new(file);
        let written = rmp_serde::encode::write_named(&mut writer, &checkpoint)
            .map_err(TrainError::from)
            .and_then(|_| writer.flush().map_err(TrainError::from));
        if let Err(err) = written {
            drop(writer);
            if let Err(remove_err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %remove_err, "failed to remove incomplete checkpoint");
            }
            return Err(err);
        }

        info!(epoch, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    /// Restore generator and discriminator weights from `path` into the given modules.
    pub fn load<B, G, D>(path: &Path, generator: G, discriminator: D, device: &B::Device) -> Result<(G, D)>
    where
        B: Backend,
        G: Module<B>,
        D: Module<B>,
    {
        let file = File::open(path)?;
        let checkpoint: CheckpointFile<ItemOf<B, G>, ItemOf<B, D>> =
            rmp_serde::decode::from_read(BufReader::new(file)).map_err(|err| {
                TrainError::CheckpointCorrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            })?;

        let generator_record = <G::Record as Record<B>>::from_item::<FullPrecisionSettings>(
            checkpoint.generator,
            device,
        );
        let discriminator_record = <D::Record as Record<B>>::from_item::<FullPrecisionSettings>(
            checkpoint.discriminator,
            device,
        );

        info!(path = %path.display(), "loaded checkpoint");
        Ok((
            generator.load_record(generator_record),
            discriminator.load_record(discriminator_record),
        ))
    }

    /// Restore only the generator weights, still requiring exactly `{G, D}`.
    pub fn load_generator<B, G>(path: &Path, generator: G, device: &B::Device) -> Result<G>
    where
        B: Backend,
        G: Module<B>,
    {
        let file = File::open(path)?;
        let checkpoint: CheckpointFile<ItemOf<B, G>, serde::de::IgnoredAny> =
            rmp_serde::decode::from_read(BufReader::new(file)).map_err(|err| {
                TrainError::CheckpointCorrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            })?;

        let record = <G::Record as Record<B>>::from_item::<FullPrecisionSettings>(
            checkpoint.generator,
            device,
        );
        info!(path = %path.display(), "loaded generator weights");
        Ok(generator.load_record(record))
    }

    /// A checkpoint file as is, or the newest checkpoint inside a directory.
    pub fn resolve(path: &Path) -> Result<PathBuf> {
        if !path.is_dir() {
            return Ok(path.to_path_buf());
        }
        Self::new(path)
            .latest()?
            .ok_or_else(|| TrainError::DataUnavailable {
                path: path.to_path_buf(),
            })
    }

    /// Most recently modified checkpoint in the store, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let pattern = format!(
            "{}/epoch_*.{CHECKPOINT_EXTENSION}",
            glob::Pattern::escape(&self.dir.to_string_lossy())
        );
        let paths = glob::glob(&pattern)
            .map_err(|err| TrainError::Configuration(format!("bad checkpoint pattern: {err}")))?;

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for path in paths.filter_map(std::result::Result::ok) {
            let modified = fs::metadata(&path)?.modified()?;
            if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn create_unique(&self, epoch: usize, timestamp: &str) -> Result<(PathBuf, File)> {
        let mut attempt = 0usize;
        loop {
            let name = if attempt == 0 {
                format!("epoch_{epoch}_{timestamp}.{CHECKPOINT_EXTENSION}")
            } else {
                format!("epoch_{epoch}_{timestamp}_{attempt}.{CHECKPOINT_EXTENSION}")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Epoch index embedded in a checkpoint file name (`epoch_{k}_...`).
pub fn checkpoint_epoch(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix("epoch_")?;
    rest.split('_').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ema::parameter_snapshot;
    use crate::model::ModelConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> ModelConfig {
        ModelConfig::new()
            .with_image_size(16)
            .with_ngf(4)
            .with_n_downsampling(1)
            .with_n_blocks(1)
            .with_ndf(4)
            .with_n_layers_d(2)
            .with_num_d(2)
    }

    #[test]
    fn round_trip_restores_both_networks() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let generator = config.init_generator::<TestBackend>(&device);
        let discriminator = config.init_discriminator::<TestBackend>(&device);
        let store = CheckpointStore::new(dir.path());

        let path = store.save(3, &generator, &discriminator).unwrap();
        let (loaded_g, loaded_d) = CheckpointStore::load(
            &path,
            config.init_generator::<TestBackend>(&device),
            config.init_discriminator::<TestBackend>(&device),
            &device,
        )
        .unwrap();

        assert_eq!(parameter_snapshot(&loaded_g).unwrap(), parameter_snapshot(&generator).unwrap());
        assert_eq!(parameter_snapshot(&loaded_d).unwrap(), parameter_snapshot(&discriminator).unwrap());
        assert_eq!(checkpoint_epoch(&path), Some(3));
    }

    #[test]
    fn saves_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let generator = config.init_generator::<TestBackend>(&device);
        let discriminator = config.init_discriminator::<TestBackend>(&device);
        let store = CheckpointStore::new(dir.path());

        let first = store.save(0, &generator, &discriminator).unwrap();
        let second = store.save(0, &generator, &discriminator).unwrap();

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        assert_eq!(checkpoint_epoch(&second), Some(0));
        assert!(store.latest().unwrap().is_some());
    }

    #[test]
    fn missing_discriminator_is_corrupt() {
        #[derive(Serialize)]
        struct GeneratorOnly<G> {
            #[serde(rename = "G")]
            generator: G,
        }

        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let generator = config.init_generator::<TestBackend>(&device);
        let path = dir.path().join("epoch_0_broken.mpk");
        let mut file = BufWriter::new(File::create(&path).unwrap());
        rmp_serde::encode::write_named(
            &mut file,
            &GeneratorOnly {
                generator: generator.into_record().into_item::<FullPrecisionSettings>(),
            },
        )
        .unwrap();
        file.flush().unwrap();
        drop(file);

        let result = CheckpointStore::load(
            &path,
            config.init_generator::<TestBackend>(&device),
            config.init_discriminator::<TestBackend>(&device),
            &device,
        );

        assert!(matches!(result, Err(TrainError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn generator_alone_can_be_restored_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let generator = config.init_generator::<TestBackend>(&device);
        let discriminator = config.init_discriminator::<TestBackend>(&device);
        CheckpointStore::new(dir.path())
            .save(1, &generator, &discriminator)
            .unwrap();

        let path = CheckpointStore::resolve(dir.path()).unwrap();
        let loaded = CheckpointStore::load_generator::<TestBackend, _>(
            &path,
            config.init_generator::<TestBackend>(&device),
            &device,
        )
        .unwrap();

        assert_eq!(parameter_snapshot(&loaded).unwrap(), parameter_snapshot(&generator).unwrap());
    }

    #[test]
    fn latest_handles_glob_characters_in_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let store = CheckpointStore::new(root.path().join("run[1]*?"));
        let generator = config.init_generator::<TestBackend>(&device);
        let discriminator = config.init_discriminator::<TestBackend>(&device);

        let path = store.save(4, &generator, &discriminator).unwrap();

        assert_eq!(store.latest().unwrap(), Some(path));
    }

    #[test]
    fn empty_directory_has_nothing_to_resolve() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointStore::resolve(dir.path()).is_err());
    }

    #[test]
    fn epoch_is_parsed_from_suffixed_names() {
        assert_eq!(checkpoint_epoch(Path::new("epoch_12_2024-01-01-10-30_2.mpk")), Some(12));
        assert_eq!(checkpoint_epoch(Path::new("weights.mpk")), None);
    }
}
