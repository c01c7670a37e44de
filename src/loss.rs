//! Composite inpainting loss
//!
//! ```text
//! total = hole + 6·valid + 0.05·perceptual + 120·(style_pred + style_comp) + 0.1·tv
//! ```
//!
//! - hole / valid: L1 between prediction and ground truth inside / outside the holes
//! - perceptual: L1 between feature maps of the prediction (and of the composite)
//!   and those of the ground truth
//! - style: L1 between Gram matrices of the same feature maps
//! - tv: total variation of the composite over the holes dilated by one pixel
//!
//! Every term is a per-sample mean; the scalar objective is the batch mean of
//! the per-sample totals. `evaluate_with_gradient` also returns the gradient
//! of that scalar with respect to the prediction, which is what the network
//! back-propagates.

use crate::features::FeatureExtractor;
use crate::layers::conv2d::{conv2d_forward, ConvGeometry};
use crate::tensor::{DataLayout, Tensor4};
use serde::{Deserialize, Serialize};

/// Term weights of the composite loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub hole: f32,
    pub valid: f32,
    pub perceptual: f32,
    pub style: f32,
    pub tv: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            hole: 1.0,
            valid: 6.0,
            perceptual: 0.05,
            style: 120.0,
            tv: 0.1,
        }
    }
}

/// Unweighted terms and weighted total, each averaged over the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    pub hole: f32,
    pub valid: f32,
    pub perceptual: f32,
    pub style_pred: f32,
    pub style_comp: f32,
    pub tv: f32,
    pub total: f32,
}

/// Per-sample channel-by-channel inner products, shape (batch, C, C).
#[derive(Debug, Clone, PartialEq)]
pub struct GramMatrix {
    batch: usize,
    channels: usize,
    data: Vec<f32>,
}

impl GramMatrix {
    /// # Panics
    ///
    /// Panics if `data.len() != batch * channels * channels`.
    pub fn from_vec(batch: usize, channels: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), batch * channels * channels, "gram data len mismatch");
        Self {
            batch,
            channels,
            data,
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.batch, self.channels, self.channels]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, b: usize, i: usize, j: usize) -> f32 {
        self.data[(b * self.channels + i) * self.channels + j]
    }
}

#[inline]
fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn batch_mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64) as f32
}

/// Mean absolute error over every axis except the first (batch).
///
/// Only rank-3 (Gram matrices) and rank-4 (images, feature maps) shapes are supported.
///
/// # Panics
///
/// Panics with `unimplemented!` for any other rank, and if the buffers do not
/// match `shape`.
pub fn l1(y_true: &[f32], y_pred: &[f32], shape: &[usize]) -> Vec<f32> {
    match shape.len() {
        3 | 4 => {}
        rank => unimplemented!("L1 error is not implemented for rank-{} tensors", rank),
    }
    let batch = shape[0];
    let per_sample: usize = shape[1..].iter().product();
    assert_eq!(y_true.len(), y_pred.len(), "l1: length mismatch");
    assert_eq!(y_true.len(), batch * per_sample, "l1: shape does not match data");
    if per_sample == 0 {
        return vec![0.0; batch];
    }

    y_true
        .chunks(per_sample)
        .zip(y_pred.chunks(per_sample))
        .map(|(t, p)| {
            let sum: f64 = t.iter().zip(p).map(|(&a, &b)| (a - b).abs() as f64).sum();
            (sum / per_sample as f64) as f32
        })
        .collect()
}

/// `l1` on two tensors of identical dims and layout.
pub fn l1_tensors(y_true: &Tensor4, y_pred: &Tensor4) -> Vec<f32> {
    y_true.assert_same_dims(y_pred, "l1");
    l1(y_true.data(), y_pred.data(), &y_true.shape())
}

/// Gram matrix of a channel-last feature map: FᵀF / (C·H·W) per sample, with
/// F the (H·W, C) reshaping of the map.
///
/// # Panics
///
/// Panics if `x` is not channel-last or has no pixels or channels.
pub fn gram_matrix(x: &Tensor4) -> GramMatrix {
    assert_eq!(
        x.layout(),
        DataLayout::ChannelsLast,
        "gram matrix expects channel-last features"
    );
    let (batch, h, w, c) = x.dims();
    assert!(
        h * w * c > 0,
        "gram matrix expects non-empty feature maps, got {}x{}x{}",
        h,
        w,
        c
    );
    let norm = (c * h * w).max(1) as f64;
    let mut data = vec![0.0f32; batch * c * c];

    for (b, sample) in x.data().chunks(h * w * c).enumerate().take(batch) {
        let mut acc = vec![0.0f64; c * c];
        for row in sample.chunks(c) {
            for i in 0..c {
                let ri = row[i] as f64;
                if ri == 0.0 {
                    continue;
                }
                for j in i..c {
                    acc[i * c + j] += ri * row[j] as f64;
                }
            }
        }
        let out = &mut data[b * c * c..(b + 1) * c * c];
        for i in 0..c {
            for j in i..c {
                let v = (acc[i * c + j] / norm) as f32;
                out[i * c + j] = v;
                out[j * c + i] = v;
            }
        }
    }

    GramMatrix {
        batch,
        channels: c,
        data,
    }
}

/// Gradient of `gram_matrix` with respect to its input, given dL/dG.
///
/// dL/dF[p, i] = Σ_j (dG[i, j] + dG[j, i]) · F[p, j] / (C·H·W)
pub fn gram_matrix_backward(x: &Tensor4, grad_gram: &GramMatrix) -> Tensor4 {
    let (batch, h, w, c) = x.dims();
    assert_eq!(x.layout(), DataLayout::ChannelsLast, "gram backward expects channel-last");
    assert_eq!(grad_gram.shape(), [batch, c, c], "gram gradient shape mismatch");
    let norm = (c * h * w).max(1) as f32;
    let mut grad = x.zeros_like();
    let sample_len = h * w * c;

    for b in 0..batch {
        let g = &grad_gram.data[b * c * c..(b + 1) * c * c];
        let sym: Vec<f32> = (0..c * c)
            .map(|k| (g[k] + g[(k % c) * c + k / c]) / norm)
            .collect();
        let src = &x.data()[b * sample_len..(b + 1) * sample_len];
        let dst = &mut grad.data_mut()[b * sample_len..(b + 1) * sample_len];
        for (row, out) in src.chunks(c).zip(dst.chunks_mut(c)) {
            for i in 0..c {
                out[i] = (0..c).map(|j| sym[i * c + j] * row[j]).sum();
            }
        }
    }
    grad
}

/// predicted · (1 − mask) + ground_truth · mask
pub fn composite(mask: &Tensor4, y_true: &Tensor4, y_pred: &Tensor4) -> Tensor4 {
    mask.assert_same_dims(y_true, "composite mask/ground truth");
    mask.assert_same_dims(y_pred, "composite mask/prediction");
    let data = mask
        .data()
        .iter()
        .zip(y_true.data().iter().zip(y_pred.data()))
        .map(|(&m, (&t, &p))| p * (1.0 - m) + t * m)
        .collect();
    let (b, h, w, c) = mask.dims();
    Tensor4::from_vec(b, h, w, c, mask.layout(), data)
}

/// L1 over the holes.
pub fn loss_hole(mask: &Tensor4, y_true: &Tensor4, y_pred: &Tensor4) -> Vec<f32> {
    let inv = mask.map(|m| 1.0 - m);
    l1_tensors(&inv.mul(y_true), &inv.mul(y_pred))
}

/// L1 over the known pixels.
pub fn loss_valid(mask: &Tensor4, y_true: &Tensor4, y_pred: &Tensor4) -> Vec<f32> {
    l1_tensors(&mask.mul(y_true), &mask.mul(y_pred))
}

/// Σ over depths of L1(pred, gt) + L1(comp, gt) in feature space.
pub fn loss_perceptual(
    features_pred: &[Tensor4; 3],
    features_comp: &[Tensor4; 3],
    features_gt: &[Tensor4; 3],
) -> Vec<f32> {
    let batch = features_gt[0].batch();
    let mut loss = vec![0.0f32; batch];
    for i in 0..3 {
        let a = l1_tensors(&features_pred[i], &features_gt[i]);
        let b = l1_tensors(&features_comp[i], &features_gt[i]);
        for (l, (x, y)) in loss.iter_mut().zip(a.iter().zip(&b)) {
            *l += x + y;
        }
    }
    loss
}

/// Σ over depths of L1 between Gram matrices.
pub fn loss_style(features: &[Tensor4; 3], features_gt: &[Tensor4; 3]) -> Vec<f32> {
    let batch = features_gt[0].batch();
    let mut loss = vec![0.0f32; batch];
    for i in 0..3 {
        let g = gram_matrix(&features[i]);
        let g_gt = gram_matrix(&features_gt[i]);
        for (l, v) in loss.iter_mut().zip(l1(g_gt.data(), g.data(), &g.shape())) {
            *l += v;
        }
    }
    loss
}

/// Holes grown by one pixel: a 3x3 all-ones convolution of (1 − mask) over
/// all channels, thresholded at > 0.
pub fn dilated_hole_region(mask: &Tensor4) -> Tensor4 {
    let c = mask.channels();
    let kernel = vec![1.0f32; 9 * c * c];
    let holes = mask.map(|m| 1.0 - m);
    conv2d_forward(&holes, &kernel, c, ConvGeometry::same(3, 1))
        .map(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

/// Mean absolute differences between vertical and horizontal neighbours.
fn total_variation(p: &Tensor4) -> Vec<f32> {
    let (batch, h, w, c) = p.dims();
    let n_v = (h.saturating_sub(1) * w * c) as f64;
    let n_h = (h * w.saturating_sub(1) * c) as f64;
    (0..batch)
        .map(|b| {
            let mut vertical = 0.0f64;
            let mut horizontal = 0.0f64;
            for y in 0..h {
                for x in 0..w {
                    for ch in 0..c {
                        let v = p.get(b, y, x, ch);
                        if y + 1 < h {
                            vertical += (p.get(b, y + 1, x, ch) - v).abs() as f64;
                        }
                        if x + 1 < w {
                            horizontal += (p.get(b, y, x + 1, ch) - v).abs() as f64;
                        }
                    }
                }
            }
            let mut total = 0.0;
            if n_v > 0.0 {
                total += vertical / n_v;
            }
            if n_h > 0.0 {
                total += horizontal / n_h;
            }
            total as f32
        })
        .collect()
}

/// Total variation of the composite restricted to the dilated holes.
pub fn loss_tv(mask: &Tensor4, y_comp: &Tensor4) -> Vec<f32> {
    let dilated = dilated_hole_region(mask);
    total_variation(&dilated.mul(y_comp))
}

/// Peak signal-to-noise ratio for images in [0, 1]: −10·log10(MSE).
pub fn psnr(y_true: &Tensor4, y_pred: &Tensor4) -> f32 {
    y_true.assert_same_dims(y_pred, "psnr");
    if y_true.is_empty() {
        return f32::INFINITY;
    }
    let mse = y_true
        .data()
        .iter()
        .zip(y_pred.data())
        .map(|(&a, &b)| ((a - b) as f64).powi(2))
        .sum::<f64>()
        / y_true.len() as f64;
    (-10.0 * mse.log10()) as f32
}

/// The composite objective with configurable term weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeLoss {
    weights: LossWeights,
}

struct Evaluation {
    breakdown: LossBreakdown,
    comp: Tensor4,
    features_pred: [Tensor4; 3],
    features_comp: [Tensor4; 3],
    features_gt: [Tensor4; 3],
}

impl CompositeLoss {
    pub fn new(weights: LossWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    fn check_inputs(mask: &Tensor4, y_true: &Tensor4, y_pred: &Tensor4) {
        y_pred.assert_same_dims(y_true, "loss prediction/ground truth");
        mask.assert_same_dims(y_pred, "loss mask/prediction");
    }

    fn run(
        &self,
        extractor: &dyn FeatureExtractor,
        mask: &Tensor4,
        y_true: &Tensor4,
        y_pred: &Tensor4,
    ) -> Evaluation {
        Self::check_inputs(mask, y_true, y_pred);
        let w = &self.weights;
        let comp = composite(mask, y_true, y_pred);

        let features_pred = extractor.extract(y_pred);
        let features_comp = extractor.extract(&comp);
        let features_gt = extractor.extract(y_true);

        let hole = loss_hole(mask, y_true, y_pred);
        let valid = loss_valid(mask, y_true, y_pred);
        let perceptual = loss_perceptual(&features_pred, &features_comp, &features_gt);
        let style_pred = loss_style(&features_pred, &features_gt);
        let style_comp = loss_style(&features_comp, &features_gt);
        let tv = loss_tv(mask, &comp);

        let totals: Vec<f32> = (0..y_pred.batch())
            .map(|b| {
                w.hole * hole[b]
                    + w.valid * valid[b]
                    + w.perceptual * perceptual[b]
                    + w.style * (style_pred[b] + style_comp[b])
                    + w.tv * tv[b]
            })
            .collect();

        Evaluation {
            breakdown: LossBreakdown {
                hole: batch_mean(&hole),
                valid: batch_mean(&valid),
                perceptual: batch_mean(&perceptual),
                style_pred: batch_mean(&style_pred),
                style_comp: batch_mean(&style_comp),
                tv: batch_mean(&tv),
                total: batch_mean(&totals),
            },
            comp,
            features_pred,
            features_comp,
            features_gt,
        }
    }

    /// Loss terms for one batch. `mask` is the network's input mask.
    pub fn evaluate(
        &self,
        extractor: &dyn FeatureExtractor,
        mask: &Tensor4,
        y_true: &Tensor4,
        y_pred: &Tensor4,
    ) -> LossBreakdown {
        self.run(extractor, mask, y_true, y_pred).breakdown
    }

    /// Loss terms plus d(total)/d(y_pred), in the layout of `y_pred`.
    pub fn evaluate_with_gradient(
        &self,
        extractor: &dyn FeatureExtractor,
        mask: &Tensor4,
        y_true: &Tensor4,
        y_pred: &Tensor4,
    ) -> (LossBreakdown, Tensor4) {
        let eval = self.run(extractor, mask, y_true, y_pred);
        let w = &self.weights;
        let scale = 1.0 / y_pred.batch().max(1) as f32;
        let n_px = y_pred.sample_len().max(1) as f32;

        // Pixel terms
        let mut grad = y_pred.zeros_like();
        for (idx, g) in grad.data_mut().iter_mut().enumerate() {
            let m = mask.data()[idx];
            let (p, t) = (y_pred.data()[idx], y_true.data()[idx]);
            let hole = sign((1.0 - m) * p - (1.0 - m) * t);
            let valid = sign(m * p - m * t);
            *g = scale / n_px * (w.hole * hole * (1.0 - m) + w.valid * valid * m);
        }

        // Feature terms, through the extractor
        let grads_pred = self.feature_gradients(&eval.features_pred, &eval.features_gt, scale);
        let grads_comp = self.feature_gradients(&eval.features_comp, &eval.features_gt, scale);
        grad.add_assign(&extractor.backward(y_pred, &grads_pred));
        let mut grad_comp = extractor.backward(&eval.comp, &grads_comp);

        // Total variation, on the composite
        grad_comp.add_assign(&self.tv_gradient(mask, &eval.comp, scale));

        // d comp / d pred = 1 − mask
        for ((g, &gc), &m) in grad
            .data_mut()
            .iter_mut()
            .zip(grad_comp.data())
            .zip(mask.data())
        {
            *g += gc * (1.0 - m);
        }

        (eval.breakdown, grad)
    }

    /// Gradients of the weighted perceptual and style terms with respect to
    /// `features` (one of the compared sides).
    fn feature_gradients(
        &self,
        features: &[Tensor4; 3],
        features_gt: &[Tensor4; 3],
        scale: f32,
    ) -> [Tensor4; 3] {
        let w = &self.weights;
        let grad_at = |i: usize| {
            let f = &features[i];
            let n = f.sample_len().max(1) as f32;
            let mut g = f.zip_map(&features_gt[i], |a, b| w.perceptual * scale * sign(a - b) / n);

            let gram = gram_matrix(f);
            let gram_gt = gram_matrix(&features_gt[i]);
            let c = gram.channels();
            let n_gram = (c * c).max(1) as f32;
            let d_gram = GramMatrix {
                batch: gram.batch,
                channels: c,
                data: gram
                    .data
                    .iter()
                    .zip(&gram_gt.data)
                    .map(|(&a, &b)| w.style * scale * sign(a - b) / n_gram)
                    .collect(),
            };
            g.add_assign(&gram_matrix_backward(f, &d_gram));
            g
        };
        [grad_at(0), grad_at(1), grad_at(2)]
    }

    /// d(weighted tv)/d(composite).
    fn tv_gradient(&self, mask: &Tensor4, comp: &Tensor4, scale: f32) -> Tensor4 {
        let dilated = dilated_hole_region(mask);
        let p = dilated.mul(comp);
        let (batch, h, w, c) = p.dims();
        let n_v = (h.saturating_sub(1) * w * c).max(1) as f32;
        let n_h = (h * w.saturating_sub(1) * c).max(1) as f32;
        let k_v = self.weights.tv * scale / n_v;
        let k_h = self.weights.tv * scale / n_h;

        let mut grad_p = p.zeros_like();
        for b in 0..batch {
            for y in 0..h {
                for x in 0..w {
                    for ch in 0..c {
                        let v = p.get(b, y, x, ch);
                        let here = p.index(b, y, x, ch);
                        if y + 1 < h {
                            let below = p.index(b, y + 1, x, ch);
                            let s = k_v * sign(p.data()[below] - v);
                            grad_p.data_mut()[below] += s;
                            grad_p.data_mut()[here] -= s;
                        }
                        if x + 1 < w {
                            let right = p.index(b, y, x + 1, ch);
                            let s = k_h * sign(p.data()[right] - v);
                            grad_p.data_mut()[right] += s;
                            grad_p.data_mut()[here] -= s;
                        }
                    }
                }
            }
        }
        grad_p.mul(&dilated)
    }
}
