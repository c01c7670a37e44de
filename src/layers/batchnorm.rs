//! Batch normalization for 4-D feature maps
//!
//! Statistics are computed per channel over the batch and both spatial axes,
//! then a learnable scale (gamma) and shift (beta) are applied:
//!
//! 1. Compute batch statistics: mean μ_c and variance σ²_c over (B, H, W)
//! 2. Normalize: x_norm = (x - μ_c) / sqrt(σ²_c + ε)
//! 3. Scale and shift: y = γ_c * x_norm + β_c
//!
//! Running statistics (exponential moving averages) are kept for inference.
//! Whether a forward pass uses batch or running statistics is chosen per call
//! by `forward_mode`, because the network's encoder can be told to keep using
//! batch statistics even at inference time.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::layers::Layer;
use crate::optimizers::Optimizer;
use crate::tensor::{DataLayout, Tensor4};
use std::cell::{Cell, RefCell};

pub const DEFAULT_EPSILON: f32 = 1e-3;
pub const DEFAULT_MOMENTUM: f32 = 0.99;

/// Channel of flat element `idx` in a tensor with the given dims and layout.
#[inline]
fn channel_of(idx: usize, height: usize, width: usize, channels: usize, layout: DataLayout) -> usize {
    match layout {
        DataLayout::ChannelsLast => idx % channels,
        DataLayout::ChannelsFirst => (idx / (height * width)) % channels,
    }
}

/// Per-channel batch normalization with learnable scale and shift.
///
/// # Fields
///
/// * `channels` - Number of feature channels (unchanged by the layer)
/// * `epsilon` - Small constant added to the variance
/// * `momentum` - Momentum for updating running statistics
/// * `training` - Whether running statistics are updated by batch-statistics passes
/// * `gamma` - Learnable scale parameter (initialized to 1.0)
/// * `beta` - Learnable shift parameter (initialized to 0.0)
/// * `running_mean` - Running average of means (initialized to 0.0)
/// * `running_var` - Running average of variances (initialized to 1.0)
///
/// # Example
///
/// ```
/// use pconv_inpainting::layers::BatchNorm2D;
/// use pconv_inpainting::layers::Layer;
///
/// let layer = BatchNorm2D::with_defaults(64);
/// assert_eq!(layer.channels(), 64);
/// assert_eq!(layer.parameter_count(), 128);
/// ```
pub struct BatchNorm2D {
    channels: usize,
    epsilon: f32,
    momentum: f32,
    training: bool,

    // Learnable parameters
    gamma: Vec<f32>,
    beta: Vec<f32>,

    // Gradient accumulators (mutable interior via RefCell for trait compatibility)
    grad_gamma: RefCell<Vec<f32>>,
    grad_beta: RefCell<Vec<f32>>,

    // Running statistics (updated during training, used during inference)
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,

    // Cached values from the last forward pass (needed for backward pass)
    cached_normalized: RefCell<Vec<f32>>,
    cached_std: RefCell<Vec<f32>>,
    cached_batch_stats: Cell<bool>,
}

impl BatchNorm2D {
    /// Creates a layer with gamma = 1, beta = 0. The layer starts in training mode.
    ///
    /// # Panics
    ///
    /// Panics if `epsilon` is not positive or `momentum` is outside [0, 1].
    pub fn new(channels: usize, epsilon: f32, momentum: f32) -> Self {
        assert!(epsilon > 0.0, "epsilon must be positive");
        assert!(
            (0.0..=1.0).contains(&momentum),
            "momentum must be in range [0.0, 1.0]"
        );

        Self {
            channels,
            epsilon,
            momentum,
            training: true,
            gamma: vec![1.0f32; channels],
            beta: vec![0.0f32; channels],
            grad_gamma: RefCell::new(vec![0.0f32; channels]),
            grad_beta: RefCell::new(vec![0.0f32; channels]),
            running_mean: RefCell::new(vec![0.0f32; channels]),
            running_var: RefCell::new(vec![1.0f32; channels]),
            cached_normalized: RefCell::new(Vec::new()),
            cached_std: RefCell::new(Vec::new()),
            cached_batch_stats: Cell::new(true),
        }
    }

    /// ε = 1e-3, momentum = 0.99.
    pub fn with_defaults(channels: usize) -> Self {
        Self::new(channels, DEFAULT_EPSILON, DEFAULT_MOMENTUM)
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn gamma(&self) -> &[f32] {
        &self.gamma
    }

    pub fn beta(&self) -> &[f32] {
        &self.beta
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    pub fn gamma_gradients(&self) -> Vec<f32> {
        self.grad_gamma.borrow().clone()
    }

    pub fn beta_gradients(&self) -> Vec<f32> {
        self.grad_beta.borrow().clone()
    }

    /// Normalize with batch statistics (`use_batch_stats`) or running statistics.
    ///
    /// Running statistics are only updated when batch statistics are used
    /// while the layer is in training mode.
    pub fn forward_mode(&self, input: &Tensor4, use_batch_stats: bool) -> Tensor4 {
        let (_, height, width, channels) = input.dims();
        assert_eq!(
            channels, self.channels,
            "BatchNorm2D expects {} channels, got {}",
            self.channels, channels
        );
        let layout = input.layout();
        let data = input.data();
        let count = (input.len() / channels.max(1)).max(1) as f32;

        let (mean, var) = if use_batch_stats {
            let mut sum = vec![0.0f64; channels];
            for (idx, &v) in data.iter().enumerate() {
                sum[channel_of(idx, height, width, channels, layout)] += v as f64;
            }
            let mean: Vec<f32> = sum.iter().map(|&s| (s / count as f64) as f32).collect();

            let mut sq = vec![0.0f64; channels];
            for (idx, &v) in data.iter().enumerate() {
                let c = channel_of(idx, height, width, channels, layout);
                let diff = (v - mean[c]) as f64;
                sq[c] += diff * diff;
            }
            let var: Vec<f32> = sq.iter().map(|&s| (s / count as f64) as f32).collect();

            if self.training {
                // running = momentum * running + (1 - momentum) * batch
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for c in 0..channels {
                    running_mean[c] =
                        self.momentum * running_mean[c] + (1.0 - self.momentum) * mean[c];
                    running_var[c] =
                        self.momentum * running_var[c] + (1.0 - self.momentum) * var[c];
                }
            }
            (mean, var)
        } else {
            (self.running_mean(), self.running_var())
        };

        let std: Vec<f32> = var.iter().map(|&v| (v + self.epsilon).sqrt()).collect();
        let mut output = input.zeros_like();
        let mut normalized = vec![0.0f32; data.len()];
        for (idx, (&x, out)) in data.iter().zip(output.data_mut().iter_mut()).enumerate() {
            let c = channel_of(idx, height, width, channels, layout);
            normalized[idx] = (x - mean[c]) / std[c];
            *out = self.gamma[c] * normalized[idx] + self.beta[c];
        }

        *self.cached_normalized.borrow_mut() = normalized;
        *self.cached_std.borrow_mut() = std;
        self.cached_batch_stats.set(use_batch_stats);
        output
    }
}

impl Layer for BatchNorm2D {
    /// Batch statistics in training mode, running statistics otherwise.
    fn forward(&self, input: &Tensor4) -> Tensor4 {
        self.forward_mode(input, self.training)
    }

    /// Uses the caches of the most recent forward pass, which must have been
    /// called with `input`.
    fn backward(&self, input: &Tensor4, grad_output: &Tensor4) -> Tensor4 {
        input.assert_same_dims(grad_output, "BatchNorm2D backward");
        let (_, height, width, channels) = input.dims();
        let layout = input.layout();
        let normalized = self.cached_normalized.borrow();
        let std = self.cached_std.borrow();
        assert_eq!(
            normalized.len(),
            grad_output.len(),
            "BatchNorm2D backward called without a matching forward pass"
        );
        let grad = grad_output.data();

        // dL/dgamma = Σ g * x_norm, dL/dbeta = Σ g
        let mut sum_g = vec![0.0f64; channels];
        let mut sum_g_norm = vec![0.0f64; channels];
        for (idx, &g) in grad.iter().enumerate() {
            let c = channel_of(idx, height, width, channels, layout);
            sum_g[c] += g as f64;
            sum_g_norm[c] += (g * normalized[idx]) as f64;
        }
        {
            let mut grad_gamma = self.grad_gamma.borrow_mut();
            let mut grad_beta = self.grad_beta.borrow_mut();
            for c in 0..channels {
                grad_gamma[c] += sum_g_norm[c] as f32;
                grad_beta[c] += sum_g[c] as f32;
            }
        }

        let mut grad_input = grad_output.zeros_like();
        if !self.cached_batch_stats.get() {
            // Running statistics are constants: plain scaling
            for (idx, (gi, &g)) in grad_input.data_mut().iter_mut().zip(grad).enumerate() {
                let c = channel_of(idx, height, width, channels, layout);
                *gi = g * self.gamma[c] / std[c];
            }
            return grad_input;
        }

        // dx = γ / σ * (g - mean(g) - x_norm * mean(g * x_norm))
        let count = (grad.len() / channels.max(1)).max(1) as f64;
        let mean_g: Vec<f32> = sum_g.iter().map(|&s| (s / count) as f32).collect();
        let mean_g_norm: Vec<f32> = sum_g_norm.iter().map(|&s| (s / count) as f32).collect();
        for (idx, (gi, &g)) in grad_input.data_mut().iter_mut().zip(grad).enumerate() {
            let c = channel_of(idx, height, width, channels, layout);
            *gi = self.gamma[c] / std[c] * (g - mean_g[c] - normalized[idx] * mean_g_norm[c]);
        }
        grad_input
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer, slot: &mut usize) {
        let mut grad_gamma = self.grad_gamma.borrow_mut();
        let mut grad_beta = self.grad_beta.borrow_mut();

        optimizer.update(*slot, &mut self.gamma, &grad_gamma);
        optimizer.update(*slot + 1, &mut self.beta, &grad_beta);
        *slot += 2;

        grad_gamma.iter_mut().for_each(|g| *g = 0.0);
        grad_beta.iter_mut().for_each(|g| *g = 0.0);
    }

    /// gamma + beta; running statistics are not trainable.
    fn parameter_count(&self) -> usize {
        2 * self.channels
    }
}
