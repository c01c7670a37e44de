//! Layer trait definition for single-input layers
//!
//! The partial convolution takes an (image, mask) pair and has its own API;
//! this trait covers the plain layers that sit around it: the output
//! projection, the feature extractor's convolutions and batch normalization.

use crate::optimizers::Optimizer;
use crate::tensor::Tensor4;

/// Core trait for single-input layers.
///
/// # Example
///
/// ```ignore
/// let output = layer.forward(&input);
/// let grad_input = layer.backward(&input, &grad_output);
/// layer.update_with_optimizer(&mut optimizer, &mut slot);
/// ```
pub trait Layer {
    /// Forward propagation through the layer.
    ///
    /// # Panics
    ///
    /// Implementations panic if the input does not match the layer's channel count.
    fn forward(&self, input: &Tensor4) -> Tensor4;

    /// Backward propagation through the layer.
    ///
    /// Accumulates parameter gradients internally and returns the gradient
    /// with respect to `input`.
    ///
    /// # Notes
    ///
    /// - `input` must be the tensor used in the corresponding forward pass
    /// - Gradients accumulate until `update_with_optimizer` applies and clears them
    fn backward(&self, input: &Tensor4, grad_output: &Tensor4) -> Tensor4;

    /// Apply accumulated gradients with `optimizer` and clear them.
    ///
    /// `slot` is the optimizer slot of the layer's first parameter tensor; it
    /// is advanced past every tensor the layer owns.
    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer, slot: &mut usize);

    /// Number of trainable parameters.
    fn parameter_count(&self) -> usize;
}
