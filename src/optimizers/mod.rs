//! Optimizer abstractions for parameter updates
//!
//! Every trainable tensor in the network (a partial-convolution kernel, a bias,
//! a batch-norm scale, ...) is identified by a *slot*: a stable index assigned
//! by visiting the network's parameters in a fixed order. Stateful optimizers
//! keep one block of state per slot.
//!
//! # Example
//!
//! ```ignore
//! use pconv_inpainting::optimizers::{Optimizer, Adam};
//!
//! let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-8);
//! optimizer.update(0, &mut kernel, &kernel_grad);
//! optimizer.update(1, &mut bias, &bias_grad);
//! ```

pub mod adam;

pub use adam::Adam;

/// Core trait for optimizers.
pub trait Optimizer {
    /// Apply the update rule to one parameter tensor in-place.
    ///
    /// # Arguments
    ///
    /// * `slot` - Stable index of the parameter tensor
    /// * `parameters` - Parameters to update
    /// * `gradients` - Gradient of the loss with respect to each parameter
    ///
    /// # Panics
    ///
    /// Implementations panic if `parameters` and `gradients` have different lengths.
    fn update(&mut self, slot: usize, parameters: &mut [f32], gradients: &[f32]);

    /// Clear all accumulated state.
    fn reset(&mut self);

    /// Base learning rate.
    fn learning_rate(&self) -> f32;

    /// Change the base learning rate.
    fn set_learning_rate(&mut self, lr: f32);
}
