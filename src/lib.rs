#![recursion_limit = "256"]
//! Adversarial training for pix2pixHD-style image-to-image translation on Burn.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod ema;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod replay;
pub mod sampling;
pub mod training;
pub mod utils;

pub use error::{Result, TrainError};
