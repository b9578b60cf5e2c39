use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the training core.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("paired sample unavailable: {}", path.display())]
    DataUnavailable { path: PathBuf },

    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("training failed during epoch {epoch}: {source}")]
    TrainingStep {
        epoch: usize,
        #[source]
        source: Box<TrainError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("tensor data error: {0}")]
    Tensor(String),
}

impl TrainError {
    /// Wrap a phase failure with the epoch it happened in.
    pub fn in_epoch(self, epoch: usize) -> Self {
        match self {
            err @ TrainError::TrainingStep { .. } => err,
            err => TrainError::TrainingStep {
                epoch,
                source: Box::new(err),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
