//! Spatial resampling: nearest-neighbour 2x upsampling and 2x2 max pooling

use crate::tensor::Tensor4;

/// Repeat every pixel into a 2x2 block.
pub fn upsample_nearest2x(input: &Tensor4) -> Tensor4 {
    let (batch, h, w, c) = input.dims();
    Tensor4::from_fn(batch, h * 2, w * 2, c, input.layout(), |b, y, x, ch| {
        input.get(b, y / 2, x / 2, ch)
    })
}

/// Gradient of `upsample_nearest2x`: each source pixel collects its 2x2 block.
pub fn upsample_nearest2x_backward(grad_output: &Tensor4) -> Tensor4 {
    let (batch, h2, w2, c) = grad_output.dims();
    assert!(
        h2 % 2 == 0 && w2 % 2 == 0,
        "upsample backward expects even spatial dims, got {}x{}",
        h2,
        w2
    );
    Tensor4::from_fn(batch, h2 / 2, w2 / 2, c, grad_output.layout(), |b, y, x, ch| {
        grad_output.get(b, 2 * y, 2 * x, ch)
            + grad_output.get(b, 2 * y, 2 * x + 1, ch)
            + grad_output.get(b, 2 * y + 1, 2 * x, ch)
            + grad_output.get(b, 2 * y + 1, 2 * x + 1, ch)
    })
}

/// Result of a 2x2 max pool: the pooled tensor and, for each output element,
/// the flat input index of the winning value.
#[derive(Debug, Clone)]
pub struct PoolOutput {
    pub output: Tensor4,
    pub argmax: Vec<usize>,
}

/// 2x2 max pooling, stride 2, "valid" (odd trailing rows/columns are dropped).
pub fn max_pool2x2(input: &Tensor4) -> PoolOutput {
    let (batch, h, w, c) = input.dims();
    let (out_h, out_w) = (h / 2, w / 2);
    let mut output = Tensor4::zeros(batch, out_h, out_w, c, input.layout());
    let mut argmax = vec![0usize; output.len()];

    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for ch in 0..c {
                    let mut best_idx = input.index(b, 2 * oy, 2 * ox, ch);
                    let mut best = input.data()[best_idx];
                    for (dy, dx) in [(0, 1), (1, 0), (1, 1)] {
                        let idx = input.index(b, 2 * oy + dy, 2 * ox + dx, ch);
                        if input.data()[idx] > best {
                            best = input.data()[idx];
                            best_idx = idx;
                        }
                    }
                    let out_idx = output.index(b, oy, ox, ch);
                    output.data_mut()[out_idx] = best;
                    argmax[out_idx] = best_idx;
                }
            }
        }
    }

    PoolOutput { output, argmax }
}

/// Route pooled gradients back to the winning input positions.
pub fn max_pool2x2_backward(pool: &PoolOutput, input: &Tensor4, grad_output: &Tensor4) -> Tensor4 {
    grad_output.assert_same_dims(&pool.output, "max_pool2x2 backward");
    let mut grad_input = input.zeros_like();
    for (&src, &g) in pool.argmax.iter().zip(grad_output.data()) {
        grad_input.data_mut()[src] += g;
    }
    grad_input
}
