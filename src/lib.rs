//! Image inpainting with partial convolutions
//!
//! A U-Net of partial convolutions fills irregular holes in images. It is
//! trained with a composite loss that mixes pixel terms with perceptual and
//! style terms computed on a frozen VGG16 feature extractor.
//!
//! # Modules
//!
//! - `tensor`: rank-4 tensor with channel-last / channel-first layouts
//! - `layers`: partial convolution, convolution, batch norm, resampling
//! - `features`: frozen VGG16 feature extractor (blocks 1-3)
//! - `loss`: hole/valid/perceptual/style/TV loss, Gram matrix, PSNR
//! - `network`: the partial-convolution U-Net
//! - `architecture`: stage-list configuration and network building
//! - `mask`: random irregular hole masks
//! - `training`: training loop, callbacks, loss logging
//! - `optimizers`: Optimizer trait and Adam
//! - `config`: run configuration loaded from JSON
//! - `utils`: RNG, activations, initializers

pub mod architecture;
pub mod config;
pub mod features;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod network;
pub mod optimizers;
pub mod tensor;
pub mod training;
pub mod utils;
