//! Activation functions for the inpainting network
//!
//! Element-wise nonlinearities used by the partial-convolution stages, the
//! output projection and the feature extractor. Every activation has a
//! derivative expressed in terms of its *pre-activation* input, which is what
//! the backward passes cache.

use serde::{Deserialize, Serialize};

/// Negative slope used by decoder stages.
pub const DEFAULT_LEAKY_RELU_ALPHA: f32 = 0.2;

/// Sigmoid: 1 / (1 + exp(-x)).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// ReLU activation applied in-place.
pub fn relu_inplace(data: &mut [f32]) {
    for value in data.iter_mut() {
        if *value < 0.0 {
            *value = 0.0;
        }
    }
}

/// Leaky ReLU applied in-place: x for x > 0, alpha * x otherwise.
pub fn leaky_relu_inplace(data: &mut [f32], alpha: f32) {
    for value in data.iter_mut() {
        if *value < 0.0 {
            *value *= alpha;
        }
    }
}

/// Nonlinearity selector carried by layer configurations.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    Relu,
    LeakyRelu {
        alpha: f32,
    },
    Sigmoid,
}

impl Activation {
    /// Leaky ReLU with the decoder's default slope.
    pub fn leaky_relu() -> Self {
        Activation::LeakyRelu {
            alpha: DEFAULT_LEAKY_RELU_ALPHA,
        }
    }

    /// Apply the activation to one value.
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative at pre-activation value `x`.
    #[inline]
    pub fn derivative(&self, x: f32) -> f32 {
        match *self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
        }
    }

    /// Apply in-place to a buffer.
    pub fn apply_inplace(&self, data: &mut [f32]) {
        match *self {
            Activation::Linear => {}
            Activation::Relu => relu_inplace(data),
            Activation::LeakyRelu { alpha } => leaky_relu_inplace(data, alpha),
            Activation::Sigmoid => {
                for value in data.iter_mut() {
                    *value = sigmoid(*value);
                }
            }
        }
    }

    /// Multiply `grad` in-place by the derivative evaluated at `pre_activation`.
    pub fn backward_inplace(&self, pre_activation: &[f32], grad: &mut [f32]) {
        assert_eq!(
            pre_activation.len(),
            grad.len(),
            "activation backward: length mismatch"
        );
        if *self == Activation::Linear {
            return;
        }
        for (g, &z) in grad.iter_mut().zip(pre_activation.iter()) {
            *g *= self.derivative(z);
        }
    }
}
