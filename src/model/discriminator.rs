use crate::model::layers::instance_norm;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{InstanceNorm, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Per-head activations: every intermediate block output followed by the
/// final patch prediction.
pub type ScaleOutputs<B> = Vec<Vec<Tensor<B, 4>>>;

const MAX_FILTERS: usize = 512;

/// Configuration for a single PatchGAN head.
#[derive(Config, Debug)]
pub struct NLayerDiscriminatorConfig {
    pub input_channels: usize,
    pub ndf: usize,
    pub n_layers: usize,
}

/// PatchGAN discriminator exposing its intermediate features.
#[derive(Module, Debug)]
pub struct NLayerDiscriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<InstanceNorm<B>>,
}

impl NLayerDiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> NLayerDiscriminator<B> {
        let mut convs = Vec::with_capacity(self.n_layers + 2);
        let mut norms = Vec::with_capacity(self.n_layers);

        let mut filters = self.ndf;
        convs.push(conv(self.input_channels, filters, 2, device));
        for _ in 1..self.n_layers {
            let previous = filters;
            filters = (filters * 2).min(MAX_FILTERS);
            convs.push(conv(previous, filters, 2, device));
            norms.push(instance_norm(filters, device));
        }

        let previous = filters;
        filters = (filters * 2).min(MAX_FILTERS);
        convs.push(conv(previous, filters, 1, device));
        norms.push(instance_norm(filters, device));

        convs.push(conv(filters, 1, 1, device));

        NLayerDiscriminator { convs, norms }
    }
}

impl<B: Backend> NLayerDiscriminator<B> {
    /// Forward pass returning `n_layers + 1` feature maps and the final prediction.
    pub fn forward(&self, pair: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let last = self.convs.len() - 1;
        let mut outputs = Vec::with_capacity(self.convs.len());

        let mut x = leaky_relu(self.convs[0].forward(pair), 0.2);
        outputs.push(x.clone());
        for idx in 1..last {
            x = leaky_relu(self.norms[idx - 1].forward(self.convs[idx].forward(x)), 0.2);
            outputs.push(x.clone());
        }
        outputs.push(self.convs[last].forward(x));
        outputs
    }

    /// Number of intermediate activations, excluding the final prediction.
    pub fn feature_layers(&self) -> usize {
        self.convs.len() - 1
    }
}

/// Configuration for a set of PatchGAN heads at decreasing resolutions.
#[derive(Config, Debug)]
pub struct MultiscaleDiscriminatorConfig {
    pub input_channels: usize,
    pub ndf: usize,
    pub n_layers: usize,
    pub num_d: usize,
}

/// Independent PatchGAN heads, each judging the pair at half the previous
/// head's resolution.
#[derive(Module, Debug)]
pub struct MultiscaleDiscriminator<B: Backend> {
    heads: Vec<NLayerDiscriminator<B>>,
    downsample: AvgPool2d,
}

impl MultiscaleDiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiscaleDiscriminator<B> {
        let head = NLayerDiscriminatorConfig::new(self.input_channels, self.ndf, self.n_layers);
        let heads = (0..self.num_d).map(|_| head.init(device)).collect();
        let downsample = AvgPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_count_include_pad(false)
            .init();

        MultiscaleDiscriminator { heads, downsample }
    }
}

impl<B: Backend> MultiscaleDiscriminator<B> {
    /// Judge a channel-concatenated (source, candidate) pair at every scale,
    /// finest head first.
    pub fn forward(&self, pair: Tensor<B, 4>) -> ScaleOutputs<B> {
        let mut outputs = Vec::with_capacity(self.heads.len());
        let mut x = pair;
        for (idx, head) in self.heads.iter().enumerate() {
            outputs.push(head.forward(x.clone()));
            if idx + 1 != self.heads.len() {
                x = self.downsample.forward(x);
            }
        }
        outputs
    }

    /// Total intermediate activations across all heads.
    pub fn feature_layer_count(&self) -> usize {
        self.heads.iter().map(|head| head.feature_layers()).sum()
    }

    pub fn num_scales(&self) -> usize {
        self.heads.len()
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(2, 2))
        .init(device)
}
