//! Adam (Adaptive Moment Estimation) optimizer implementation

use crate::optimizers::Optimizer;

/// Moment estimates for one parameter tensor.
#[derive(Debug, Clone, Default)]
struct MomentState {
    /// First moment estimates (momentum)
    m: Vec<f32>,
    /// Second moment estimates (adaptive learning rate)
    v: Vec<f32>,
    /// Number of updates applied to this slot, for bias correction
    t: usize,
}

/// Adam optimizer with per-slot state.
///
/// The update rule is:
///
/// ```text
/// m_t = β1 * m_{t-1} + (1 - β1) * gradient
/// v_t = β2 * v_{t-1} + (1 - β2) * gradient²
/// m_hat = m_t / (1 - β1^t)
/// v_hat = v_t / (1 - β2^t)
/// parameter = parameter - α * m_hat / (√v_hat + ε)
/// ```
///
/// Each slot keeps its own `m`, `v` and `t`; since every slot is updated once
/// per training step, `t` equals the global step count.
///
/// # Reference
///
/// Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
/// arXiv preprint arXiv:1412.6980.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    states: Vec<MomentState>,
}

impl Adam {
    /// Creates a new Adam optimizer.
    ///
    /// # Examples
    ///
    /// ```
    /// use pconv_inpainting::optimizers::{Adam, Optimizer};
    ///
    /// let optimizer = Adam::new(0.001, 0.9, 0.999, 1e-8);
    /// assert_eq!(optimizer.learning_rate(), 0.001);
    /// ```
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            states: Vec::new(),
        }
    }

    /// Number of slots that have received at least one update.
    pub fn slot_count(&self) -> usize {
        self.states.iter().filter(|s| s.t > 0).count()
    }

    /// Number of updates applied to `slot` so far.
    pub fn step_count(&self, slot: usize) -> usize {
        self.states.get(slot).map_or(0, |s| s.t)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, slot: usize, parameters: &mut [f32], gradients: &[f32]) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );

        if self.states.len() <= slot {
            self.states.resize_with(slot + 1, MomentState::default);
        }
        let (beta1, beta2) = (self.beta1, self.beta2);
        let state = &mut self.states[slot];

        // Initialize moment vectors on first use
        if state.m.len() != parameters.len() {
            state.m = vec![0.0; parameters.len()];
            state.v = vec![0.0; parameters.len()];
            state.t = 0;
        }

        state.t += 1;
        let bias_correction1 = 1.0 - beta1.powi(state.t as i32);
        let bias_correction2 = 1.0 - beta2.powi(state.t as i32);

        for i in 0..parameters.len() {
            let g = gradients[i];
            state.m[i] = beta1 * state.m[i] + (1.0 - beta1) * g;
            state.v[i] = beta2 * state.v[i] + (1.0 - beta2) * g * g;

            let m_hat = state.m[i] / bias_correction1;
            let v_hat = state.v[i] / bias_correction2;

            parameters[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.states.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
