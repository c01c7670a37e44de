//! Simple random number generator for reproducibility.
//!
//! A lightweight xorshift PRNG shared by weight initialization and mask
//! generation, so a single seed reproduces a whole run.

/// Xorshift RNG. Deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state }
    }

    /// Basic xorshift to generate u32.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Convert to [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() as f64 / (u32::MAX as f64 + 1.0)) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Integer sample in [0, upper).
    pub fn gen_usize(&mut self, upper: usize) -> usize {
        if upper == 0 {
            0
        } else {
            (self.next_u32() as usize) % upper
        }
    }

    /// Integer sample in [low, high], both ends inclusive.
    ///
    /// Returns `low` when the range is empty.
    pub fn gen_range_inclusive(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            low
        } else {
            low + self.gen_usize(high - low + 1)
        }
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_gaussian(&mut self) -> f32 {
        // 1 - u keeps the log argument in (0, 1]
        let u1 = 1.0 - self.next_f32();
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}
