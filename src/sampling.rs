use crate::data::PairBatch;
use crate::error::Result;
use crate::model::Generator;
use crate::utils::{concat_images_horiz, save_image, stack_images_vert, tensor_to_images};
use burn::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes qualitative snapshots of the smoothed generator to `{dir}/{epoch}_{iteration}.jpg`.
#[derive(Clone, Debug)]
pub struct SampleWriter {
    dir: PathBuf,
}

impl SampleWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Translate `batch.input` and save one `[input | generated | target]` row per item.
    pub fn write<B: Backend>(
        &self,
        generator: &Generator<B>,
        batch: &PairBatch<B>,
        epoch: usize,
        iteration: usize,
    ) -> Result<PathBuf> {
        let generated = generator.forward(batch.input.clone());

        let inputs = tensor_to_images(batch.input.clone())?;
        let outputs = tensor_to_images(generated)?;
        let targets = tensor_to_images(batch.target.clone())?;

        let rows = inputs
            .into_iter()
            .zip(outputs)
            .zip(targets)
            .map(|((input, output), target)| concat_images_horiz(&[input, output, target]))
            .collect::<Result<Vec<_>>>()?;
        let sheet = stack_images_vert(&rows)?;

        let path = self.dir.join(format!("{epoch}_{iteration}.jpg"));
        save_image(&sheet, &path)?;
        debug!(path = %path.display(), rows = rows.len(), "saved samples");
        Ok(path)
    }
}
