//! Layer building blocks for the inpainting network
//!
//! The Layer trait covers the single-input layers; the partial convolution
//! takes an (image, mask) pair and exposes its own forward/backward API.

mod r#trait;
pub mod batchnorm;
pub mod conv2d;
pub mod partial_conv;
pub mod sampling;

// Re-export the Layer trait for convenience
pub use r#trait::Layer;
pub use batchnorm::BatchNorm2D;
pub use conv2d::{Conv2DLayer, ConvGeometry};
pub use partial_conv::{PConvConfig, PConvOutput, PConvTrace, PartialConv2D};
