use crate::model::layers::{instance_norm, ResnetBlock};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the pix2pixHD global generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    pub ngf: usize,
    pub n_downsampling: usize,
    pub n_blocks: usize,
}

/// Encoder / residual bottleneck / decoder generator mapping a source image
/// to a target image of the same shape.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: InstanceNorm<B>,
    down_convs: Vec<Conv2d<B>>,
    down_norms: Vec<InstanceNorm<B>>,
    blocks: Vec<ResnetBlock<B>>,
    up_convs: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<InstanceNorm<B>>,
    head: Conv2d<B>,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let stem = conv(self.input_channels, self.ngf, 7, 1, 3, device);
        let stem_norm = instance_norm(self.ngf, device);

        let mut down_convs = Vec::with_capacity(self.n_downsampling);
        let mut down_norms = Vec::with_capacity(self.n_downsampling);
        for i in 0..self.n_downsampling {
            let channels = self.ngf << i;
            down_convs.push(conv(channels, channels * 2, 3, 2, 1, device));
            down_norms.push(instance_norm(channels * 2, device));
        }

        let bottleneck = self.ngf << self.n_downsampling;
        let blocks = (0..self.n_blocks)
            .map(|_| ResnetBlock::new(bottleneck, device))
            .collect();

        let mut up_convs = Vec::with_capacity(self.n_downsampling);
        let mut up_norms = Vec::with_capacity(self.n_downsampling);
        for i in 0..self.n_downsampling {
            let channels = self.ngf << (self.n_downsampling - i);
            up_convs.push(
                ConvTranspose2dConfig::new([channels, channels / 2], [3, 3])
                    .with_stride([2, 2])
                    .with_padding([1, 1])
                    .with_padding_out([1, 1])
                    .init(device),
            );
            up_norms.push(instance_norm(channels / 2, device));
        }

        let head = conv(self.ngf, self.output_channels, 7, 1, 3, device);

        Generator {
            stem,
            stem_norm,
            down_convs,
            down_norms,
            blocks,
            up_convs,
            up_norms,
            head,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Translate a batch of source images into `[-1, 1]` target images.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.stem_norm.forward(self.stem.forward(images)));
        for (conv, norm) in self.down_convs.iter().zip(self.down_norms.iter()) {
            x = relu(norm.forward(conv.forward(x)));
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        for (conv, norm) in self.up_convs.iter().zip(self.up_norms.iter()) {
            x = relu(norm.forward(conv.forward(x)));
        }
        self.head.forward(x).tanh()
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}
