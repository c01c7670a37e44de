//! Shared utilities
//!
//! Random number generation, activation functions and weight initializers used
//! across layers, the feature extractor and the mask generator.

pub mod activations;
pub mod initializers;
pub mod rng;

pub use activations::Activation;
pub use initializers::Initializer;
pub use rng::SimpleRng;
