//! Run configuration
//!
//! One JSON file describes the image geometry, where the feature-extractor
//! weights and the architecture come from, the loss weights and the training
//! loop settings. Every field except the image size has a default.

use crate::architecture::{default_architecture, load_architecture, validate_input_size, ArchitectureConfig};
use crate::features::{MIN_IMAGE_SIZE, VGG16_BLOCK_CHANNELS};
use crate::loss::LossWeights;
use crate::tensor::DataLayout;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;

fn default_channels() -> usize {
    3
}

fn default_feature_channels() -> [usize; 3] {
    VGG16_BLOCK_CHANNELS
}

fn default_feature_seed() -> u64 {
    7
}

/// Optimizer and loop settings.
///
/// # Example
///
/// ```json
/// {
///   "steps": 200,
///   "batch_size": 4,
///   "learning_rate": 0.0002,
///   "log_every": 10,
///   "seed": 42
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of optimizer steps
    pub steps: usize,
    /// Images per batch produced by the data source
    pub batch_size: usize,
    /// Adam step size
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Emit an info log line every `log_every` steps (0 disables)
    pub log_every: usize,
    /// Seed for weight initialization, masks and synthetic data
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            batch_size: 4,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            log_every: 10,
            seed: 42,
        }
    }
}

/// Top-level configuration of a training or inference run.
///
/// # Example
///
/// ```json
/// {
///   "image_height": 256,
///   "image_width": 256,
///   "data_layout": "channels_last",
///   "feature_weights": "weights/vgg16_blocks123.json",
///   "architecture": "config/architectures/pconv_unet_256.json",
///   "loss_weights": { "hole": 1.0, "valid": 6.0, "perceptual": 0.05, "style": 120.0, "tv": 0.1 },
///   "training": { "steps": 1000, "learning_rate": 0.0002 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InpaintConfig {
    pub image_height: usize,
    pub image_width: usize,
    /// Image channels (default: 3)
    #[serde(default = "default_channels")]
    pub image_channels: usize,
    #[serde(default)]
    pub data_layout: DataLayout,
    /// Pretrained feature-extractor weights; seeded random weights when absent
    #[serde(default)]
    pub feature_weights: Option<String>,
    /// Block widths of the feature extractor (default: VGG16's 64/128/256)
    #[serde(default = "default_feature_channels")]
    pub feature_channels: [usize; 3],
    /// Seed for random feature-extractor weights
    #[serde(default = "default_feature_seed")]
    pub feature_seed: u64,
    /// Architecture file; the reference architecture when absent
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub loss_weights: LossWeights,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl InpaintConfig {
    /// Defaults for a given image size.
    pub fn new(image_height: usize, image_width: usize) -> Self {
        Self {
            image_height,
            image_width,
            image_channels: default_channels(),
            data_layout: DataLayout::default(),
            feature_weights: None,
            feature_channels: default_feature_channels(),
            feature_seed: default_feature_seed(),
            architecture: None,
            loss_weights: LossWeights::default(),
            training: TrainingConfig::default(),
        }
    }

    /// The configured architecture, loaded from disk if a path is set,
    /// checked against the image size.
    pub fn resolve_architecture(&self) -> Result<ArchitectureConfig, Box<dyn Error>> {
        check_min_image_size(self)?;
        let architecture = match &self.architecture {
            Some(path) => load_architecture(path)?,
            None => default_architecture(),
        };
        validate_input_size(&architecture, self.image_height, self.image_width)?;
        Ok(architecture)
    }
}

/// Loads a run configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use pconv_inpainting::config::load_config;
///
/// let cfg = load_config("config/inpaint_default.json").unwrap();
/// assert_eq!(cfg.image_channels, 3);
/// ```
pub fn load_config(path: &str) -> Result<InpaintConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let config: InpaintConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

fn invalid_data(message: &str) -> Box<dyn Error> {
    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn check_min_image_size(config: &InpaintConfig) -> Result<(), Box<dyn Error>> {
    if config.image_height < MIN_IMAGE_SIZE || config.image_width < MIN_IMAGE_SIZE {
        return Err(invalid_data(&format!(
            "image size {}x{} is below the feature extractor minimum of {}x{}",
            config.image_height, config.image_width, MIN_IMAGE_SIZE, MIN_IMAGE_SIZE
        )));
    }
    Ok(())
}

/// Checks values serde cannot check.
pub fn validate_config(config: &InpaintConfig) -> Result<(), Box<dyn Error>> {
    if config.image_height == 0 || config.image_width == 0 {
        return Err(invalid_data("image_height and image_width must be positive"));
    }
    check_min_image_size(config)?;
    if config.image_channels != 3 {
        return Err(invalid_data(
            "image_channels must be 3 (the feature extractor expects RGB)",
        ));
    }
    if config.feature_channels.iter().any(|&c| c == 0) {
        return Err(invalid_data("feature_channels must be positive"));
    }

    let w = &config.loss_weights;
    if [w.hole, w.valid, w.perceptual, w.style, w.tv]
        .iter()
        .any(|&v| v < 0.0 || !v.is_finite())
    {
        return Err(invalid_data("loss weights must be finite and non-negative"));
    }

    let t = &config.training;
    if t.batch_size == 0 {
        return Err(invalid_data("batch_size must be positive"));
    }
    if t.learning_rate <= 0.0 {
        return Err(invalid_data("learning_rate must be positive"));
    }
    if !(0.0..1.0).contains(&t.beta1) || !(0.0..1.0).contains(&t.beta2) {
        return Err(invalid_data("beta1 and beta2 must be in range [0.0, 1.0)"));
    }
    if t.epsilon <= 0.0 {
        return Err(invalid_data("epsilon must be positive"));
    }
    Ok(())
}
