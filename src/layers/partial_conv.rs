//! Partial convolution with mask propagation
//!
//! A partial convolution only looks at the valid (mask = 1) pixels of its
//! receptive field and rescales the result to make up for the missing ones:
//!
//! 1. gate the image with its mask
//! 2. convolve the gated image with the trainable kernel
//! 3. count valid inputs per output position by convolving the mask with an
//!    all-ones kernel
//! 4. scale the raw output by window_size / (count + ε), zeroed where the count is 0
//! 5. add the bias and apply the activation
//!
//! The propagated mask is clip(count, 0, 1): a position becomes valid as soon
//! as one valid input pixel falls inside its window. For binary input masks
//! the count is an integer, so the propagated mask stays binary; it is still
//! stored as `f32` and only ever used as a multiplicative gate.
//!
//! Every output channel sees the same count, so the mask output carries
//! `filters` identical channels.
//!
//! # Reference
//!
//! Liu, G., Reda, F. A., Shih, K. J., Wang, T.-C., Tao, A., & Catanzaro, B. (2018).
//! Image Inpainting for Irregular Holes Using Partial Convolutions. ECCV.

use crate::layers::conv2d::{
    add_channel_bias, channel_sums, conv2d_backward_input, conv2d_backward_kernel,
    conv2d_forward, ConvGeometry,
};
use crate::optimizers::Optimizer;
use crate::tensor::Tensor4;
use crate::utils::{Activation, Initializer, SimpleRng};
use log::debug;
use std::cell::RefCell;

/// Guards the renormalisation ratio against zero coverage.
pub const COVERAGE_EPSILON: f32 = 1e-6;

/// Hyperparameters of one partial convolution.
///
/// # Example
///
/// ```
/// use pconv_inpainting::layers::PConvConfig;
/// use pconv_inpainting::utils::Activation;
///
/// let config = PConvConfig::new(64, 7).with_stride(2).with_activation(Activation::Relu);
/// assert_eq!(config.filters, 64);
/// assert!(config.use_bias);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PConvConfig {
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub use_bias: bool,
    pub activation: Activation,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
}

impl PConvConfig {
    /// Stride 1, with bias, linear activation, Glorot kernel, zero bias.
    pub fn new(filters: usize, kernel_size: usize) -> Self {
        Self {
            filters,
            kernel_size,
            stride: 1,
            use_bias: true,
            activation: Activation::Linear,
            kernel_initializer: Initializer::GlorotUniform,
            bias_initializer: Initializer::Zeros,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.kernel_initializer = initializer;
        self
    }

    pub fn with_bias_initializer(mut self, initializer: Initializer) -> Self {
        self.bias_initializer = initializer;
        self
    }

    fn geometry(&self) -> ConvGeometry {
        ConvGeometry::same(self.kernel_size, self.stride)
    }

    fn validate(&self) {
        assert!(self.filters > 0, "filters must be positive");
        assert!(
            self.kernel_size > 0 && self.kernel_size % 2 == 1,
            "kernel_size must be odd, got {}",
            self.kernel_size
        );
        assert!(self.stride > 0, "stride must be positive");
    }
}

/// Updated image and propagated mask.
#[derive(Debug, Clone)]
pub struct PConvOutput {
    pub image: Tensor4,
    pub mask: Tensor4,
}

/// Intermediate values of one forward pass, consumed by `backward`.
#[derive(Debug, Clone)]
pub struct PConvTrace {
    /// Input mask (gates the input gradient).
    pub mask: Tensor4,
    /// image ⊙ mask
    pub gated: Tensor4,
    /// One channel per output position: window_size / (count + ε) · clip(count, 0, 1).
    pub ratio: Tensor4,
    /// Renormalised output plus bias, before the activation.
    pub pre_activation: Tensor4,
}

/// Partial convolution operator owning its kernel and bias.
pub struct PartialConv2D {
    config: PConvConfig,
    in_channels: usize,
    window_size: f32,
    weights: Vec<f32>, // [k, k, in_channels, filters]
    // All-ones (k, k, in_channels, 1): every output channel shares the same count
    mask_kernel: Vec<f32>,
    bias: Option<Vec<f32>>,
    grad_weights: RefCell<Vec<f32>>,
    grad_bias: RefCell<Vec<f32>>,
}

impl PartialConv2D {
    /// Build an operator for inputs with `in_channels` channels.
    ///
    /// # Panics
    ///
    /// Panics on zero filters, zero stride or an even kernel size.
    pub fn new(config: PConvConfig, in_channels: usize, rng: &mut SimpleRng) -> Self {
        config.validate();
        let area = config.kernel_size * config.kernel_size;
        let weights = config.kernel_initializer.initialize(
            area * in_channels * config.filters,
            area * in_channels,
            area * config.filters,
            rng,
        );
        let bias = config.use_bias.then(|| {
            config
                .bias_initializer
                .initialize(config.filters, in_channels, config.filters, rng)
        });
        debug!(
            "PartialConv2D: {} -> {} channels, kernel {}, stride {}",
            in_channels, config.filters, config.kernel_size, config.stride
        );
        Self::from_parameters(config, in_channels, weights, bias)
    }

    /// Build an operator from explicit parameters.
    ///
    /// # Panics
    ///
    /// Panics if the parameter lengths disagree with the config, or if a bias
    /// is given to a bias-less config (and vice versa).
    pub fn from_parameters(
        config: PConvConfig,
        in_channels: usize,
        weights: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Self {
        config.validate();
        let area = config.kernel_size * config.kernel_size;
        assert_eq!(
            weights.len(),
            area * in_channels * config.filters,
            "weights len mismatch"
        );
        assert_eq!(
            bias.is_some(),
            config.use_bias,
            "bias presence must match use_bias"
        );
        if let Some(b) = &bias {
            assert_eq!(b.len(), config.filters, "bias len mismatch");
        }
        let weight_count = weights.len();
        Self {
            config,
            in_channels,
            window_size: (area * in_channels) as f32,
            weights,
            mask_kernel: vec![1.0; area * in_channels],
            bias,
            grad_weights: RefCell::new(vec![0.0; weight_count]),
            grad_bias: RefCell::new(vec![0.0; config.filters]),
        }
    }

    pub fn config(&self) -> &PConvConfig {
        &self.config
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn filters(&self) -> usize {
        self.config.filters
    }

    /// Number of entries in one all-ones window: k · k · in_channels.
    pub fn window_size(&self) -> f32 {
        self.window_size
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    pub fn weight_gradients(&self) -> Vec<f32> {
        self.grad_weights.borrow().clone()
    }

    pub fn bias_gradients(&self) -> Vec<f32> {
        self.grad_bias.borrow().clone()
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.as_ref().map_or(0, Vec::len)
    }

    /// Number of optimizer slots this operator occupies.
    pub fn slot_count(&self) -> usize {
        if self.bias.is_some() {
            2
        } else {
            1
        }
    }

    pub fn zero_grad(&self) {
        self.grad_weights.borrow_mut().iter_mut().for_each(|g| *g = 0.0);
        self.grad_bias.borrow_mut().iter_mut().for_each(|g| *g = 0.0);
    }

    pub fn forward(&self, image: &Tensor4, mask: &Tensor4) -> PConvOutput {
        self.forward_trace(image, mask).0
    }

    /// Forward pass that also returns what `backward` needs.
    ///
    /// # Panics
    ///
    /// Panics if image and mask differ in dimensions or layout, or if the
    /// channel count differs from `in_channels`.
    pub fn forward_trace(&self, image: &Tensor4, mask: &Tensor4) -> (PConvOutput, PConvTrace) {
        image.assert_same_dims(mask, "PartialConv2D image/mask");
        assert_eq!(
            image.channels(),
            self.in_channels,
            "PartialConv2D expects {} input channels, got {}",
            self.in_channels,
            image.channels()
        );
        let geometry = self.config.geometry();
        let filters = self.config.filters;

        let gated = image.mul(mask);
        let raw = conv2d_forward(&gated, &self.weights, filters, geometry);
        let count = conv2d_forward(mask, &self.mask_kernel, 1, geometry);

        let window_size = self.window_size;
        let coverage = count.map(|c| c.clamp(0.0, 1.0));
        let ratio = count.map(|c| window_size / (c + COVERAGE_EPSILON) * c.clamp(0.0, 1.0));

        let (batch, out_h, out_w, _) = raw.dims();
        let layout = raw.layout();
        let updated_mask = Tensor4::from_fn(batch, out_h, out_w, filters, layout, |b, y, x, _| {
            coverage.get(b, y, x, 0)
        });

        let mut pre_activation =
            Tensor4::from_fn(batch, out_h, out_w, filters, layout, |b, y, x, c| {
                raw.get(b, y, x, c) * ratio.get(b, y, x, 0)
            });
        if let Some(bias) = &self.bias {
            add_channel_bias(&mut pre_activation, bias);
        }

        let mut output = pre_activation.clone();
        self.config.activation.apply_inplace(output.data_mut());

        (
            PConvOutput {
                image: output,
                mask: updated_mask,
            },
            PConvTrace {
                mask: mask.clone(),
                gated,
                ratio,
                pre_activation,
            },
        )
    }

    /// Accumulate parameter gradients and return dL/d(input image).
    ///
    /// The mask path is not differentiated.
    pub fn backward(&self, trace: &PConvTrace, grad_output: &Tensor4) -> Tensor4 {
        grad_output.assert_same_dims(&trace.pre_activation, "PartialConv2D backward");
        let geometry = self.config.geometry();

        let mut grad_pre = grad_output.clone();
        self.config
            .activation
            .backward_inplace(trace.pre_activation.data(), grad_pre.data_mut());

        if self.bias.is_some() {
            for (acc, g) in self
                .grad_bias
                .borrow_mut()
                .iter_mut()
                .zip(channel_sums(&grad_pre))
            {
                *acc += g;
            }
        }

        let (batch, out_h, out_w, filters) = grad_pre.dims();
        let grad_raw = Tensor4::from_fn(
            batch,
            out_h,
            out_w,
            filters,
            grad_pre.layout(),
            |b, y, x, c| grad_pre.get(b, y, x, c) * trace.ratio.get(b, y, x, 0),
        );

        let grad_w = conv2d_backward_kernel(&trace.gated, &grad_raw, geometry);
        for (acc, g) in self.grad_weights.borrow_mut().iter_mut().zip(grad_w) {
            *acc += g;
        }

        let grad_gated = conv2d_backward_input(
            &grad_raw,
            &self.weights,
            trace.gated.sample_indexer(),
            geometry,
        );
        grad_gated.mul(&trace.mask)
    }

    /// Apply accumulated gradients and clear them. Kernel first, then bias.
    pub fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer, slot: &mut usize) {
        {
            let grad_w = self.grad_weights.borrow();
            optimizer.update(*slot, &mut self.weights, &grad_w);
        }
        *slot += 1;
        if let Some(bias) = self.bias.as_mut() {
            let grad_b = self.grad_bias.borrow();
            optimizer.update(*slot, bias, &grad_b);
            *slot += 1;
        }
        self.zero_grad();
    }
}
