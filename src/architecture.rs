//! Architecture configuration structures
//!
//! The U-Net topology is described by two stage lists loaded from JSON, so the
//! network can be resized without code changes.

use crate::network::PConvUNet;
use crate::utils::activations::DEFAULT_LEAKY_RELU_ALPHA;
use crate::utils::rng::SimpleRng;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;

fn default_true() -> bool {
    true
}

fn default_output_channels() -> usize {
    3
}

fn default_leaky_relu_alpha() -> f32 {
    DEFAULT_LEAKY_RELU_ALPHA
}

/// One encoder or decoder stage.
///
/// # Example
///
/// ```json
/// { "filters": 128, "kernel_size": 5, "batch_norm": true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Output channels of the stage's partial convolution
    pub filters: usize,
    /// Square kernel size, must be odd
    pub kernel_size: usize,
    /// Batch normalization after the convolution (default: true)
    #[serde(default = "default_true")]
    pub batch_norm: bool,
}

impl StageConfig {
    pub fn new(filters: usize, kernel_size: usize, batch_norm: bool) -> Self {
        Self {
            filters,
            kernel_size,
            batch_norm,
        }
    }
}

/// Configuration for the entire network.
///
/// The decoder list is applied deepest-first: decoder stage `i` upsamples the
/// previous output and concatenates the encoder output of matching resolution
/// (the network input for the last stage).
///
/// # Example
///
/// ```json
/// {
///   "encoder": [
///     { "filters": 16, "kernel_size": 5, "batch_norm": false },
///     { "filters": 32, "kernel_size": 3 }
///   ],
///   "decoder": [
///     { "filters": 16, "kernel_size": 3 },
///     { "filters": 3, "kernel_size": 3, "batch_norm": false }
///   ],
///   "train_encoder_bn": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub encoder: Vec<StageConfig>,
    pub decoder: Vec<StageConfig>,
    /// Encoder batch norm always uses batch statistics; false freezes it to
    /// its running statistics (default: true)
    #[serde(default = "default_true")]
    pub train_encoder_bn: bool,
    /// Channels of the sigmoid output projection (default: 3)
    #[serde(default = "default_output_channels")]
    pub output_channels: usize,
    /// Negative slope of the decoder activations (default: 0.2)
    #[serde(default = "default_leaky_relu_alpha")]
    pub leaky_relu_alpha: f32,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        default_architecture()
    }
}

/// The 8-level reference network for 512x512 images.
pub fn default_architecture() -> ArchitectureConfig {
    let mut encoder = vec![
        StageConfig::new(64, 7, false),
        StageConfig::new(128, 5, true),
        StageConfig::new(256, 5, true),
    ];
    encoder.extend((0..5).map(|_| StageConfig::new(512, 3, true)));

    let mut decoder: Vec<StageConfig> = (0..4).map(|_| StageConfig::new(512, 3, true)).collect();
    decoder.extend([
        StageConfig::new(256, 3, true),
        StageConfig::new(128, 3, true),
        StageConfig::new(64, 3, true),
        StageConfig::new(3, 3, false),
    ]);

    ArchitectureConfig {
        encoder,
        decoder,
        train_encoder_bn: true,
        output_channels: default_output_channels(),
        leaky_relu_alpha: DEFAULT_LEAKY_RELU_ALPHA,
    }
}

fn invalid_data(message: String) -> Box<dyn Error> {
    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

/// Loads an architecture configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use pconv_inpainting::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
/// assert_eq!(arch.encoder.len(), arch.decoder.len());
/// ```
pub fn load_architecture(path: &str) -> Result<ArchitectureConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Validates the stage lists.
///
/// # Errors
///
/// Returns an `InvalidData` error if:
/// - The encoder is empty or the lists differ in length
/// - Any stage has zero filters or an even kernel size
/// - `output_channels` is zero or `leaky_relu_alpha` is negative
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<(), Box<dyn Error>> {
    if config.encoder.is_empty() {
        return Err(invalid_data(
            "Architecture must have at least one encoder stage".to_string(),
        ));
    }
    if config.encoder.len() != config.decoder.len() {
        return Err(invalid_data(format!(
            "Encoder has {} stages but decoder has {}",
            config.encoder.len(),
            config.decoder.len()
        )));
    }

    let stages = config
        .encoder
        .iter()
        .map(|s| ("Encoder", s))
        .enumerate()
        .chain(config.decoder.iter().map(|s| ("Decoder", s)).enumerate());
    for (i, (part, stage)) in stages {
        if stage.filters == 0 {
            return Err(invalid_data(format!(
                "{} stage {}: filters must be positive",
                part, i
            )));
        }
        if stage.kernel_size % 2 == 0 {
            return Err(invalid_data(format!(
                "{} stage {}: kernel_size must be odd, got {}",
                part, i, stage.kernel_size
            )));
        }
    }

    if config.output_channels == 0 {
        return Err(invalid_data("output_channels must be positive".to_string()));
    }
    if config.leaky_relu_alpha < 0.0 {
        return Err(invalid_data(
            "leaky_relu_alpha must be non-negative".to_string(),
        ));
    }
    Ok(())
}

/// Checks that `height` and `width` survive `depth` halvings and doublings.
pub fn validate_input_size(
    config: &ArchitectureConfig,
    height: usize,
    width: usize,
) -> Result<(), Box<dyn Error>> {
    let factor = 1usize
        .checked_shl(config.encoder.len() as u32)
        .ok_or_else(|| invalid_data("architecture is too deep".to_string()))?;
    if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
        return Err(invalid_data(format!(
            "Image size {}x{} must be a non-zero multiple of {} for {} encoder stages",
            height,
            width,
            factor,
            config.encoder.len()
        )));
    }
    Ok(())
}

/// Validate the configuration and build the network.
///
/// # Examples
///
/// ```
/// use pconv_inpainting::architecture::{build_unet, ArchitectureConfig, StageConfig};
/// use pconv_inpainting::utils::SimpleRng;
///
/// let config = ArchitectureConfig {
///     encoder: vec![StageConfig::new(4, 3, false)],
///     decoder: vec![StageConfig::new(3, 3, false)],
///     train_encoder_bn: true,
///     output_channels: 3,
///     leaky_relu_alpha: 0.2,
/// };
/// let mut rng = SimpleRng::new(42);
/// let network = build_unet(&config, 3, &mut rng).unwrap();
/// assert_eq!(network.depth(), 1);
/// ```
pub fn build_unet(
    config: &ArchitectureConfig,
    in_channels: usize,
    rng: &mut SimpleRng,
) -> Result<PConvUNet, Box<dyn Error>> {
    validate_architecture(config)?;
    if in_channels == 0 {
        return Err(invalid_data("in_channels must be positive".to_string()));
    }
    Ok(PConvUNet::new(config, in_channels, rng))
}
