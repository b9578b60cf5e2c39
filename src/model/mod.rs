pub mod discriminator;
pub mod generator;
pub mod layers;

use burn::prelude::*;

pub use discriminator::{
    MultiscaleDiscriminator, MultiscaleDiscriminatorConfig, NLayerDiscriminator,
    NLayerDiscriminatorConfig, ScaleOutputs,
};
pub use generator::{Generator, GeneratorConfig};

/// Hyperparameters for the generator and the multi-scale discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 256)]
    pub image_size: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 3)]
    pub output_channels: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 4)]
    pub n_downsampling: usize,
    #[config(default = 9)]
    pub n_blocks: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_layers_d: usize,
    #[config(default = 3)]
    pub num_d: usize,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(
            self.input_channels,
            self.output_channels,
            self.ngf,
            self.n_downsampling,
            self.n_blocks,
        )
    }

    pub fn discriminator_config(&self) -> MultiscaleDiscriminatorConfig {
        MultiscaleDiscriminatorConfig::new(
            self.input_channels + self.output_channels,
            self.ndf,
            self.n_layers_d,
            self.num_d,
        )
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> MultiscaleDiscriminator<B> {
        self.discriminator_config().init(device)
    }
}

/// Concatenate a source image and a candidate target along channels, the
/// layout the discriminator judges.
pub fn condition_pair<B: Backend>(input: Tensor<B, 4>, candidate: Tensor<B, 4>) -> Tensor<B, 4> {
    Tensor::cat(vec![input, candidate], 1)
}
