//! Weight initializers for convolution kernels and biases

use crate::utils::rng::SimpleRng;
use serde::{Deserialize, Serialize};

/// How a parameter tensor is filled at construction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    /// Xavier/Glorot uniform: U(-limit, limit), limit = sqrt(6 / (fan_in + fan_out)).
    #[default]
    GlorotUniform,
    /// He normal: N(0, 2 / fan_in).
    HeNormal,
    Zeros,
    Constant {
        value: f32,
    },
}

impl Initializer {
    /// Allocate `count` values for a tensor with the given fan-in and fan-out.
    pub fn initialize(
        &self,
        count: usize,
        fan_in: usize,
        fan_out: usize,
        rng: &mut SimpleRng,
    ) -> Vec<f32> {
        match *self {
            Initializer::GlorotUniform => {
                let limit = (6.0f32 / (fan_in + fan_out).max(1) as f32).sqrt();
                (0..count).map(|_| rng.gen_range_f32(-limit, limit)).collect()
            }
            Initializer::HeNormal => {
                let std = (2.0f32 / fan_in.max(1) as f32).sqrt();
                (0..count).map(|_| rng.next_gaussian() * std).collect()
            }
            Initializer::Zeros => vec![0.0; count],
            Initializer::Constant { value } => vec![value; count],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glorot_bounds() {
        let mut rng = SimpleRng::new(42);
        // 3x3 kernel, 3 -> 8 channels
        let fan_in = 3 * 3 * 3;
        let fan_out = 3 * 3 * 8;
        let limit = (6.0f32 / (fan_in + fan_out) as f32).sqrt();
        let values = Initializer::GlorotUniform.initialize(216, fan_in, fan_out, &mut rng);

        assert_eq!(values.len(), 216);
        for &w in &values {
            assert!(
                w >= -limit && w <= limit,
                "Weight {} outside Xavier bounds [{}, {}]",
                w,
                -limit,
                limit
            );
        }
    }

    #[test]
    fn test_deterministic_initialization() {
        let mut rng1 = SimpleRng::new(12345);
        let mut rng2 = SimpleRng::new(12345);
        let a = Initializer::HeNormal.initialize(64, 27, 72, &mut rng1);
        let b = Initializer::HeNormal.initialize(64, 27, 72, &mut rng2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_constant_and_zeros() {
        let mut rng = SimpleRng::new(1);
        assert_eq!(Initializer::Zeros.initialize(3, 1, 1, &mut rng), vec![0.0; 3]);
        assert_eq!(
            Initializer::Constant { value: 0.5 }.initialize(2, 1, 1, &mut rng),
            vec![0.5; 2]
        );
    }
}
