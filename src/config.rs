use crate::error::{Result as TrainResult, TrainError};
use crate::loss::LossConfig;
use crate::model::ModelConfig;
use burn::config::Config;
use burn::optim::AdamWConfig;

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub optimizer_gen: AdamWConfig,
    pub optimizer_disc: AdamWConfig,
    pub data_dir: String,
    #[config(default = "String::from(\"train\")")]
    pub train_split: String,
    #[config(default = "String::from(\"test\")")]
    pub sample_split: String,
    #[config(default = "String::from(\"sketch\")")]
    pub source_folder: String,
    #[config(default = "String::from(\"photo\")")]
    pub target_folder: String,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 0.9999)]
    pub ema_decay: f64,
    #[config(default = 50)]
    pub replay_capacity: usize,
    #[config(default = 0.5)]
    pub replay_swap_probability: f64,
    /// Render EMA samples every this many batches (0 disables periodic sampling).
    #[config(default = 100)]
    pub sample_every: usize,
    /// Write a checkpoint every this many batches (0 disables periodic checkpoints).
    #[config(default = 1000)]
    pub checkpoint_every: usize,
    #[config(default = 0.5)]
    pub flip_probability: f64,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Reject configurations that cannot produce a working trainer.
    pub fn validate(&self) -> TrainResult<()> {
        let model = &self.model;
        let fail = |message: String| Err(TrainError::Configuration(message));

        if self.batch_size == 0 {
            return fail("batch_size must be positive".to_string());
        }
        if self.num_epochs == 0 {
            return fail("num_epochs must be positive".to_string());
        }
        if model.input_channels == 0 || model.output_channels == 0 || model.ngf == 0 || model.ndf == 0 {
            return fail("channel counts must be positive".to_string());
        }
        let stride = u32::try_from(model.n_downsampling)
            .ok()
            .and_then(|n| 1usize.checked_shl(n))
            .filter(|stride| model.ngf.checked_mul(*stride).is_some());
        let Some(stride) = stride else {
            return fail(format!(
                "n_downsampling {} overflows the generator's channel count",
                model.n_downsampling
            ));
        };
        if model.image_size == 0 || model.image_size % stride != 0 {
            return fail(format!(
                "image_size {} must be a positive multiple of {stride} for {} downsampling steps",
                model.image_size, model.n_downsampling
            ));
        }
        if model.num_d == 0 || model.n_layers_d == 0 {
            return fail("the discriminator needs at least one scale and one layer".to_string());
        }
        for (name, value) in [
            ("ema_decay", self.ema_decay),
            ("replay_swap_probability", self.replay_swap_probability),
            ("flip_probability", self.flip_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} must be in [0, 1], got {value}"));
            }
        }
        if self.loss.lambda_feat < 0.0 {
            return fail(format!("lambda_feat must be non-negative, got {}", self.loss.lambda_feat));
        }
        let perceptual = &self.loss.perceptual;
        if perceptual.channels.is_empty() || perceptual.channels.len() != perceptual.layer_weights.len() {
            return fail(format!(
                "perceptual channels ({}) and layer_weights ({}) must be non-empty and equal in length",
                perceptual.channels.len(),
                perceptual.layer_weights.len()
            ));
        }
        if self.learning_rate <= 0.0 {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrainingConfig {
        TrainingConfig::new(
            ModelConfig::new(),
            LossConfig::new(),
            AdamWConfig::new(),
            AdamWConfig::new(),
            "data".to_string(),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config = base();
        assert!(config.validate().is_ok());
        assert_eq!(config.replay_capacity, 50);
        assert_eq!(config.sample_every, 100);
        assert_eq!(config.checkpoint_every, 1000);
        assert_eq!(config.model.n_blocks, 9);
    }

    #[test]
    fn rejects_indivisible_image_size() {
        let mut config = base();
        config.model = ModelConfig::new().with_image_size(100);
        assert!(matches!(config.validate(), Err(TrainError::Configuration(_))));
    }

    #[test]
    fn rejects_downsampling_that_overflows() {
        for n_downsampling in [62, 64, 200] {
            let mut config = base();
            config.model = ModelConfig::new().with_n_downsampling(n_downsampling);
            assert!(
                matches!(config.validate(), Err(TrainError::Configuration(_))),
                "n_downsampling = {n_downsampling}"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_probabilities() {
        assert!(base().with_ema_decay(1.5).validate().is_err());
        assert!(base().with_replay_swap_probability(-0.1).validate().is_err());
    }

    #[test]
    fn rejects_mismatched_perceptual_weights() {
        let mut config = base();
        config.loss.perceptual.layer_weights = vec![1.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn survives_a_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        base().with_batch_size(2).save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();

        assert_eq!(loaded.batch_size, 2);
        assert_eq!(loaded.source_folder, "sketch");
    }
}
