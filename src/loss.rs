use crate::error::{Result as TrainResult, TrainError};
use crate::model::ScaleOutputs;
use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::activation::relu;
use std::path::PathBuf;
use tracing::warn;

/// Realism objective applied to the final prediction of every head.
#[derive(Config, Debug, PartialEq)]
pub enum GanMode {
    /// Least-squares GAN: mean squared distance to the label.
    Lsgan,
    /// Binary cross-entropy on logits.
    Vanilla,
}

/// Weighting and collaborator settings for the generator objective.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 10.0)]
    pub lambda_feat: f64,
    #[config(default = "GanMode::Lsgan")]
    pub gan_mode: GanMode,
    #[config(default = "PerceptualConfig::new()")]
    pub perceptual: PerceptualConfig,
}

/// Adversarial loss summed over discriminator scales.
#[derive(Clone, Debug)]
pub struct AdversarialCriterion {
    mode: GanMode,
}

impl AdversarialCriterion {
    pub fn new(mode: GanMode) -> Self {
        Self { mode }
    }

    /// Score every head's final prediction against the real (1) or fake (0) label.
    pub fn forward<B: Backend>(&self, outputs: &ScaleOutputs<B>, target_is_real: bool) -> Tensor<B, 1> {
        let device = outputs
            .first()
            .and_then(|head| head.last())
            .map(|pred| pred.device())
            .unwrap_or_default();

        outputs
            .iter()
            .filter_map(|head| head.last())
            .map(|pred| self.head_loss(pred.clone(), target_is_real))
            .fold(Tensor::zeros([1], &device), |total, loss| total + loss)
    }

    fn head_loss<B: Backend>(&self, pred: Tensor<B, 4>, target_is_real: bool) -> Tensor<B, 1> {
        match self.mode {
            GanMode::Lsgan => {
                let label = if target_is_real { 1.0 } else { 0.0 };
                pred.sub_scalar(label).powf_scalar(2.0).mean()
            }
            GanMode::Vanilla => {
                let device = pred.device();
                let [batch, channels, height, width] = pred.dims();
                let logits = pred.reshape([batch, channels * height * width]);
                let targets = if target_is_real {
                    Tensor::<B, 2, Int>::ones(logits.dims(), &device)
                } else {
                    Tensor::<B, 2, Int>::zeros(logits.dims(), &device)
                };
                BinaryCrossEntropyLossConfig::new()
                    .with_logits(true)
                    .init(&device)
                    .forward(logits, targets)
            }
        }
    }
}

/// L1 distance between intermediate discriminator activations on fake and
/// real pairs, normalised by `4 / feature_count` and weighted by `lambda_feat`.
///
/// The final prediction of each head is excluded; real activations are
/// treated as constants.
pub fn feature_matching_loss<B: Backend>(
    fake: &ScaleOutputs<B>,
    real: &ScaleOutputs<B>,
    lambda_feat: f64,
) -> Tensor<B, 1> {
    let device = fake
        .first()
        .and_then(|head| head.first())
        .map(|feat| feat.device())
        .unwrap_or_default();
    let mut total = Tensor::<B, 1>::zeros([1], &device);
    let mut count = 0usize;

    for (fake_head, real_head) in fake.iter().zip(real.iter()) {
        let fake_feats = &fake_head[..fake_head.len().saturating_sub(1)];
        let real_feats = &real_head[..real_head.len().saturating_sub(1)];
        for (fake_feat, real_feat) in fake_feats.iter().zip(real_feats.iter()) {
            total = total + fake_feat.clone().sub(real_feat.clone().detach()).abs().mean();
            count += 1;
        }
    }

    if count == 0 {
        return total;
    }
    total.mul_scalar(4.0 / count as f64 * lambda_feat)
}

/// Feature extractor settings for the perceptual term.
#[derive(Config, Debug)]
pub struct PerceptualConfig {
    #[config(default = "vec![64, 128, 256, 512, 512]")]
    pub channels: Vec<usize>,
    #[config(default = "vec![1.0 / 32.0, 1.0 / 16.0, 1.0 / 8.0, 1.0 / 4.0, 1.0]")]
    pub layer_weights: Vec<f64>,
    /// Pretrained extractor weights saved with `CompactRecorder`.
    #[config(default = "None")]
    pub weights_path: Option<String>,
}

#[derive(Module, Debug)]
struct FeatureStage<B: Backend> {
    pool: Option<MaxPool2d>,
    conv: Conv2d<B>,
}

impl<B: Backend> FeatureStage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        };
        relu(self.conv.forward(x))
    }
}

/// Perceptual distance in the feature space of a fixed convolutional
/// extractor. The extractor never receives optimizer updates.
#[derive(Module, Debug)]
pub struct PerceptualLoss<B: Backend> {
    stages: Vec<FeatureStage<B>>,
    layer_weights: Ignored<Vec<f64>>,
}

impl PerceptualConfig {
    /// Build the extractor, loading pretrained weights when a path is configured.
    pub fn init<B: Backend>(&self, image_channels: usize, device: &B::Device) -> TrainResult<PerceptualLoss<B>> {
        let mut stages = Vec::with_capacity(self.channels.len());
        let mut in_channels = image_channels;
        for (idx, &channels) in self.channels.iter().enumerate() {
            let pool = (idx > 0).then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());
            let conv = Conv2dConfig::new([in_channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device);
            stages.push(FeatureStage { pool, conv });
            in_channels = channels;
        }

        let loss = PerceptualLoss {
            stages,
            layer_weights: Ignored(self.layer_weights.clone()),
        };

        match &self.weights_path {
            Some(path) => {
                let path = PathBuf::from(path);
                let record = CompactRecorder::new().load(path.clone(), device).map_err(|err| {
                    TrainError::Configuration(format!(
                        "failed to load perceptual weights from {}: {err}",
                        path.display()
                    ))
                })?;
                Ok(loss.load_record(record))
            }
            None => {
                warn!("no perceptual weights configured, G_vgg uses a randomly initialized extractor");
                Ok(loss)
            }
        }
    }
}

impl<B: Backend> PerceptualLoss<B> {
    /// Weighted L1 distance between per-stage features of `fake` and `target`.
    pub fn forward(&self, fake: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let device = fake.device();
        let mut x_fake = fake;
        let mut x_target = target.detach();
        let mut total = Tensor::<B, 1>::zeros([1], &device);

        for (stage, &weight) in self.stages.iter().zip(self.layer_weights.iter()) {
            x_fake = stage.forward(x_fake);
            x_target = stage.forward(x_target);
            let distance = x_fake.clone().sub(x_target.clone().detach()).abs().mean();
            total = total + distance.mul_scalar(weight);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f64 {
        tensor.into_scalar().elem::<f64>()
    }

    fn filled(value: f32, device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(vec![value; 4], [1, 1, 2, 2]), device)
    }

    #[test]
    fn lsgan_sums_over_heads() {
        let device = Default::default();
        let outputs = vec![
            vec![filled(7.0, &device), filled(0.5, &device)],
            vec![filled(7.0, &device), filled(0.0, &device)],
        ];
        let criterion = AdversarialCriterion::new(GanMode::Lsgan);

        // (0.5 - 1)^2 + (0 - 1)^2
        assert_relative_eq!(scalar(criterion.forward(&outputs, true)), 1.25, epsilon = 1e-6);
        // 0.5^2 + 0^2
        assert_relative_eq!(scalar(criterion.forward(&outputs, false)), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn vanilla_uses_bce_on_logits() {
        let device = Default::default();
        let neutral = vec![
            vec![filled(7.0, &device), filled(0.0, &device)],
            vec![filled(7.0, &device), filled(0.0, &device)],
        ];
        let confident = vec![vec![filled(7.0, &device), filled(20.0, &device)]];
        let criterion = AdversarialCriterion::new(GanMode::Vanilla);

        // ln(2) per head at logit 0, whatever the label.
        let ln2 = std::f64::consts::LN_2;
        assert_relative_eq!(scalar(criterion.forward(&neutral, true)), 2.0 * ln2, epsilon = 1e-5);
        assert_relative_eq!(scalar(criterion.forward(&neutral, false)), 2.0 * ln2, epsilon = 1e-5);
        assert!(scalar(criterion.forward(&confident, true)) < 1e-6);
        assert_relative_eq!(scalar(criterion.forward(&confident, false)), 20.0, epsilon = 1e-4);
    }

    #[test]
    fn feature_matching_skips_final_prediction() {
        let device = Default::default();
        let fake = vec![vec![filled(1.0, &device), filled(1.0, &device), filled(100.0, &device)]];
        let real = vec![vec![filled(0.0, &device), filled(0.5, &device), filled(-100.0, &device)]];

        let loss = feature_matching_loss(&fake, &real, 10.0);

        // (1.0 + 0.5) * 4 / 2 * 10
        assert_relative_eq!(scalar(loss), 30.0, epsilon = 1e-5);
    }

    #[test]
    fn perceptual_distance_is_zero_for_identical_images() {
        let device = Default::default();
        let loss = PerceptualConfig::new()
            .with_channels(vec![4, 8])
            .with_layer_weights(vec![0.5, 1.0])
            .init::<TestBackend>(3, &device)
            .unwrap();
        let image = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);

        assert_relative_eq!(scalar(loss.forward(image.clone(), image)), 0.0, epsilon = 1e-7);
    }
}
