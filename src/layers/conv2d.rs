//! 2D convolution kernels and the Conv2DLayer
//!
//! Kernels are stored flat in (kernel_h, kernel_w, in_channels, out_channels)
//! order. Zero padding is implicit: taps that fall outside the input are
//! skipped, which is the same as convolving a zero-padded copy.
//!
//! The free functions here are shared by `Conv2DLayer`, the partial
//! convolution and the feature extractor. Each parallelises over the batch
//! axis; every batch element is written by exactly one task.

use crate::layers::Layer;
use crate::optimizers::Optimizer;
use crate::tensor::{SampleIndexer, Tensor4};
use crate::utils::{Initializer, SimpleRng};
use rayon::prelude::*;
use std::cell::RefCell;

/// Square-kernel convolution geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    /// Symmetric padding of (kernel_size - 1) / 2, so an odd kernel at stride 1
    /// preserves spatial size and stride `s` gives ceil(n / s).
    pub fn same(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
            padding: kernel_size.saturating_sub(1) / 2,
        }
    }

    /// Output length along one spatial axis:
    /// (input + 2*padding - kernel_size) / stride + 1
    pub fn output_dim(&self, input: usize) -> usize {
        let padded = input + 2 * self.padding;
        assert!(
            padded >= self.kernel_size,
            "input dimension {} too small for kernel {} with padding {}",
            input,
            self.kernel_size,
            self.padding
        );
        (padded - self.kernel_size) / self.stride + 1
    }

    /// Input coordinate hit by kernel tap `k` of output coordinate `o`, if inside.
    #[inline]
    fn input_coord(&self, o: usize, k: usize, limit: usize) -> Option<usize> {
        let i = (o * self.stride + k) as isize - self.padding as isize;
        if i >= 0 && (i as usize) < limit {
            Some(i as usize)
        } else {
            None
        }
    }
}

#[inline]
fn kernel_offset(ky: usize, kx: usize, ic: usize, k: usize, in_c: usize, out_c: usize) -> usize {
    ((ky * k + kx) * in_c + ic) * out_c
}

/// Convolve `input` with `kernel`, producing `out_channels` channels.
///
/// # Panics
///
/// Panics if the kernel length does not match k * k * in_channels * out_channels.
pub fn conv2d_forward(
    input: &Tensor4,
    kernel: &[f32],
    out_channels: usize,
    geometry: ConvGeometry,
) -> Tensor4 {
    let (batch, in_h, in_w, in_c) = input.dims();
    let k = geometry.kernel_size;
    assert_eq!(
        kernel.len(),
        k * k * in_c * out_channels,
        "kernel len mismatch: expected {}x{}x{}x{}, got {}",
        k,
        k,
        in_c,
        out_channels,
        kernel.len()
    );

    let out_h = geometry.output_dim(in_h);
    let out_w = geometry.output_dim(in_w);
    let mut output = Tensor4::zeros(batch, out_h, out_w, out_channels, input.layout());
    let in_idx = input.sample_indexer();
    let out_idx = output.sample_indexer();
    let in_len = in_idx.len();
    let out_len = out_idx.len();
    if out_len == 0 {
        return output;
    }

    output
        .data_mut()
        .par_chunks_mut(out_len)
        .enumerate()
        .for_each(|(b, out_b)| {
            let in_b = &input.data()[b * in_len..(b + 1) * in_len];
            let mut acc = vec![0.0f32; out_channels];

            for oy in 0..out_h {
                for ox in 0..out_w {
                    acc.iter_mut().for_each(|a| *a = 0.0);

                    for ky in 0..k {
                        let Some(iy) = geometry.input_coord(oy, ky, in_h) else {
                            continue;
                        };
                        for kx in 0..k {
                            let Some(ix) = geometry.input_coord(ox, kx, in_w) else {
                                continue;
                            };
                            for ic in 0..in_c {
                                let v = in_b[in_idx.at(iy, ix, ic)];
                                if v == 0.0 {
                                    continue;
                                }
                                let w_base = kernel_offset(ky, kx, ic, k, in_c, out_channels);
                                let w = &kernel[w_base..w_base + out_channels];
                                for (a, &wv) in acc.iter_mut().zip(w.iter()) {
                                    *a += v * wv;
                                }
                            }
                        }
                    }

                    for (oc, &a) in acc.iter().enumerate() {
                        out_b[out_idx.at(oy, ox, oc)] = a;
                    }
                }
            }
        });

    output
}

/// Gradient of a convolution with respect to its input.
///
/// `input_indexer` describes one batch element of the original input.
pub fn conv2d_backward_input(
    grad_output: &Tensor4,
    kernel: &[f32],
    input_indexer: SampleIndexer,
    geometry: ConvGeometry,
) -> Tensor4 {
    let (batch, out_h, out_w, out_c) = grad_output.dims();
    let SampleIndexer {
        height: in_h,
        width: in_w,
        channels: in_c,
        layout,
    } = input_indexer;
    assert_eq!(
        layout,
        grad_output.layout(),
        "conv2d_backward_input: layout mismatch"
    );
    let k = geometry.kernel_size;
    assert_eq!(
        kernel.len(),
        k * k * in_c * out_c,
        "kernel len mismatch in backward pass"
    );
    assert_eq!(geometry.output_dim(in_h), out_h, "grad_output height mismatch");
    assert_eq!(geometry.output_dim(in_w), out_w, "grad_output width mismatch");

    let mut grad_input = Tensor4::zeros(batch, in_h, in_w, in_c, layout);
    let g_idx = grad_output.sample_indexer();
    let g_len = g_idx.len();
    let in_len = input_indexer.len();
    if in_len == 0 {
        return grad_input;
    }

    grad_input
        .data_mut()
        .par_chunks_mut(in_len)
        .enumerate()
        .for_each(|(b, gi_b)| {
            let g_b = &grad_output.data()[b * g_len..(b + 1) * g_len];
            let mut g = vec![0.0f32; out_c];

            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut any = false;
                    for (oc, gv) in g.iter_mut().enumerate() {
                        *gv = g_b[g_idx.at(oy, ox, oc)];
                        any |= *gv != 0.0;
                    }
                    if !any {
                        continue;
                    }

                    for ky in 0..k {
                        let Some(iy) = geometry.input_coord(oy, ky, in_h) else {
                            continue;
                        };
                        for kx in 0..k {
                            let Some(ix) = geometry.input_coord(ox, kx, in_w) else {
                                continue;
                            };
                            for ic in 0..in_c {
                                let w_base = kernel_offset(ky, kx, ic, k, in_c, out_c);
                                let w = &kernel[w_base..w_base + out_c];
                                let sum: f32 = g.iter().zip(w.iter()).map(|(a, b)| a * b).sum();
                                gi_b[input_indexer.at(iy, ix, ic)] += sum;
                            }
                        }
                    }
                }
            }
        });

    grad_input
}

/// Gradient of a convolution with respect to its kernel.
///
/// Per-sample partial gradients are computed in parallel and then summed in
/// batch order, so the result does not depend on thread scheduling.
pub fn conv2d_backward_kernel(
    input: &Tensor4,
    grad_output: &Tensor4,
    geometry: ConvGeometry,
) -> Vec<f32> {
    let (batch, in_h, in_w, in_c) = input.dims();
    let (g_batch, out_h, out_w, out_c) = grad_output.dims();
    assert_eq!(batch, g_batch, "conv2d_backward_kernel: batch mismatch");
    assert_eq!(
        input.layout(),
        grad_output.layout(),
        "conv2d_backward_kernel: layout mismatch"
    );
    let k = geometry.kernel_size;
    let kernel_len = k * k * in_c * out_c;
    let in_idx = input.sample_indexer();
    let g_idx = grad_output.sample_indexer();
    let in_len = in_idx.len();
    let g_len = g_idx.len();

    let partials: Vec<Vec<f32>> = (0..batch)
        .into_par_iter()
        .map(|b| {
            let in_b = &input.data()[b * in_len..(b + 1) * in_len];
            let g_b = &grad_output.data()[b * g_len..(b + 1) * g_len];
            let mut grad_kernel = vec![0.0f32; kernel_len];
            let mut g = vec![0.0f32; out_c];

            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut any = false;
                    for (oc, gv) in g.iter_mut().enumerate() {
                        *gv = g_b[g_idx.at(oy, ox, oc)];
                        any |= *gv != 0.0;
                    }
                    if !any {
                        continue;
                    }

                    for ky in 0..k {
                        let Some(iy) = geometry.input_coord(oy, ky, in_h) else {
                            continue;
                        };
                        for kx in 0..k {
                            let Some(ix) = geometry.input_coord(ox, kx, in_w) else {
                                continue;
                            };
                            for ic in 0..in_c {
                                let v = in_b[in_idx.at(iy, ix, ic)];
                                if v == 0.0 {
                                    continue;
                                }
                                let w_base = kernel_offset(ky, kx, ic, k, in_c, out_c);
                                for (gw, &gv) in
                                    grad_kernel[w_base..w_base + out_c].iter_mut().zip(g.iter())
                                {
                                    *gw += v * gv;
                                }
                            }
                        }
                    }
                }
            }
            grad_kernel
        })
        .collect();

    let mut total = vec![0.0f32; kernel_len];
    for partial in &partials {
        for (t, &p) in total.iter_mut().zip(partial.iter()) {
            *t += p;
        }
    }
    total
}

/// Per-channel sum over batch and spatial axes (the bias gradient).
pub fn channel_sums(grad: &Tensor4) -> Vec<f32> {
    let (batch, h, w, c) = grad.dims();
    let mut sums = vec![0.0f32; c];
    for b in 0..batch {
        for y in 0..h {
            for x in 0..w {
                for (ch, s) in sums.iter_mut().enumerate() {
                    *s += grad.get(b, y, x, ch);
                }
            }
        }
    }
    sums
}

/// Add a per-channel bias in-place.
pub fn add_channel_bias(tensor: &mut Tensor4, bias: &[f32]) {
    let (batch, h, w, c) = tensor.dims();
    assert_eq!(bias.len(), c, "bias len mismatch");
    for b in 0..batch {
        for y in 0..h {
            for x in 0..w {
                for (ch, &bv) in bias.iter().enumerate() {
                    let idx = tensor.index(b, y, x, ch);
                    tensor.data_mut()[idx] += bv;
                }
            }
        }
    }
}

/// Standard 2D convolution with learnable kernel and bias, "same" padding.
///
/// Linear: nonlinearities are applied by the caller.
///
/// # Example
///
/// ```ignore
/// use pconv_inpainting::layers::Conv2DLayer;
/// use pconv_inpainting::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// // 64 input channels, 3 output channels, 1x1 kernel, stride 1
/// let layer = Conv2DLayer::new(64, 3, 1, 1, &mut rng);
/// assert_eq!(layer.out_channels(), 3);
/// ```
pub struct Conv2DLayer {
    in_channels: usize,
    out_channels: usize,
    geometry: ConvGeometry,
    weights: Vec<f32>, // [kernel_size * kernel_size * in_channels * out_channels]
    biases: Vec<f32>,  // [out_channels]
    // Gradient accumulators (mutable interior via RefCell for trait compatibility)
    grad_weights: RefCell<Vec<f32>>,
    grad_biases: RefCell<Vec<f32>>,
}

impl Conv2DLayer {
    /// Create a layer with Xavier (Glorot uniform) weights and zero biases.
    ///
    /// For convolutions fan_in = in_channels × kernel_size², fan_out = out_channels × kernel_size².
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut SimpleRng,
    ) -> Self {
        assert!(kernel_size % 2 == 1, "kernel_size must be odd");
        assert!(stride > 0, "stride must be positive");
        let area = kernel_size * kernel_size;
        let weights = Initializer::GlorotUniform.initialize(
            area * in_channels * out_channels,
            in_channels * area,
            out_channels * area,
            rng,
        );
        Self::from_parameters(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            weights,
            vec![0.0f32; out_channels],
        )
    }

    /// Create a layer from existing parameters (e.g. loaded from a weights file).
    ///
    /// # Panics
    ///
    /// Panics if the parameter lengths do not match the geometry.
    pub fn from_parameters(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Self {
        let weight_count = kernel_size * kernel_size * in_channels * out_channels;
        assert_eq!(weights.len(), weight_count, "weights len mismatch");
        assert_eq!(biases.len(), out_channels, "biases len mismatch");
        Self {
            in_channels,
            out_channels,
            geometry: ConvGeometry::same(kernel_size, stride),
            weights,
            biases,
            grad_weights: RefCell::new(vec![0.0f32; weight_count]),
            grad_biases: RefCell::new(vec![0.0f32; out_channels]),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.geometry.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.geometry.stride
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Copy of the accumulated kernel gradient.
    pub fn weight_gradients(&self) -> Vec<f32> {
        self.grad_weights.borrow().clone()
    }

    /// Gradient with respect to the input only; parameter gradients are untouched.
    pub fn backward_input(&self, input: &Tensor4, grad_output: &Tensor4) -> Tensor4 {
        conv2d_backward_input(
            grad_output,
            &self.weights,
            input.sample_indexer(),
            self.geometry,
        )
    }

    fn check_input(&self, input: &Tensor4) {
        assert_eq!(
            input.channels(),
            self.in_channels,
            "Conv2DLayer expects {} input channels, got {}",
            self.in_channels,
            input.channels()
        );
    }
}

impl Layer for Conv2DLayer {
    fn forward(&self, input: &Tensor4) -> Tensor4 {
        self.check_input(input);
        let mut output = conv2d_forward(input, &self.weights, self.out_channels, self.geometry);
        add_channel_bias(&mut output, &self.biases);
        output
    }

    fn backward(&self, input: &Tensor4, grad_output: &Tensor4) -> Tensor4 {
        self.check_input(input);
        let grad_w = conv2d_backward_kernel(input, grad_output, self.geometry);
        let grad_b = channel_sums(grad_output);

        for (acc, g) in self.grad_weights.borrow_mut().iter_mut().zip(grad_w) {
            *acc += g;
        }
        for (acc, g) in self.grad_biases.borrow_mut().iter_mut().zip(grad_b) {
            *acc += g;
        }

        self.backward_input(input, grad_output)
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer, slot: &mut usize) {
        let mut grad_w = self.grad_weights.borrow_mut();
        let mut grad_b = self.grad_biases.borrow_mut();

        optimizer.update(*slot, &mut self.weights, &grad_w);
        optimizer.update(*slot + 1, &mut self.biases, &grad_b);
        *slot += 2;

        grad_w.iter_mut().for_each(|g| *g = 0.0);
        grad_b.iter_mut().for_each(|g| *g = 0.0);
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}
