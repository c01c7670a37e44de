//! Tests for architecture parsing and network building
//!
//! This file tests the architecture module including:
//! - Loading the shipped stage-list files
//! - Building networks from them
//! - Rejecting unbalanced, even-kernel and empty stage lists
//! - Checking image sizes against the network depth

use pconv_inpainting::architecture::{
    build_unet, default_architecture, load_architecture, validate_architecture,
    validate_input_size, ArchitectureConfig, StageConfig,
};
use pconv_inpainting::utils::rng::SimpleRng;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_temp_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}

fn load_temp(contents: &str) -> Result<ArchitectureConfig, String> {
    let file = write_temp_config(contents);
    load_architecture(file.path().to_str().unwrap()).map_err(|e| e.to_string())
}

// ============================================================================
// Valid Architecture Loading Tests
// ============================================================================

mod valid_architecture_tests {
    use super::*;

    #[test]
    fn test_load_reference_architecture() {
        let config = load_architecture("config/architectures/pconv_unet_512.json")
            .expect("Failed to load reference architecture");
        assert_eq!(config, default_architecture());
    }

    #[test]
    fn test_load_small_architecture() {
        let config = load_architecture("config/architectures/pconv_unet_small.json").unwrap();
        assert_eq!(config.encoder.len(), 4);
        assert_eq!(config.encoder[0], StageConfig::new(16, 7, false));
        assert!(config.encoder[1].batch_norm);
        assert!(validate_input_size(&config, 64, 64).is_ok());
    }

    #[test]
    fn test_load_tiny_architecture() {
        let config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
        assert_eq!(config.encoder.len(), 2);
        assert_eq!(config.output_channels, 3);
        assert_eq!(config.leaky_relu_alpha, 0.2);
        assert!(config.train_encoder_bn);
    }

    #[test]
    fn test_optional_fields_parse() {
        let config = load_temp(
            r#"{
                "encoder": [{ "filters": 4, "kernel_size": 5 }],
                "decoder": [{ "filters": 2, "kernel_size": 1, "batch_norm": false }],
                "train_encoder_bn": false,
                "output_channels": 1,
                "leaky_relu_alpha": 0.1
            }"#,
        )
        .unwrap();
        assert!(!config.train_encoder_bn);
        assert_eq!(config.output_channels, 1);
        assert!((config.leaky_relu_alpha - 0.1).abs() < 1e-6);
    }
}

// ============================================================================
// Building
// ============================================================================

mod build_tests {
    use super::*;

    #[test]
    fn test_build_tiny_network() {
        let config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
        let mut rng = SimpleRng::new(42);
        let network = build_unet(&config, 3, &mut rng).unwrap();
        assert_eq!(network.depth(), 2);
        assert_eq!(network.in_channels(), 3);
        assert_eq!(network.output_channels(), 3);
        assert!(network.is_training());
    }

    #[test]
    fn test_build_rejects_invalid_architecture() {
        let mut config = default_architecture();
        config.decoder.pop();
        let mut rng = SimpleRng::new(42);
        assert!(build_unet(&config, 3, &mut rng).is_err());
    }

    #[test]
    fn test_build_rejects_zero_channels() {
        let config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
        let mut rng = SimpleRng::new(42);
        assert!(build_unet(&config, 0, &mut rng).is_err());
    }
}

// ============================================================================
// Invalid Architecture Tests
// ============================================================================

mod invalid_architecture_tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        assert!(load_architecture("config/architectures/nope.json").is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(load_temp("{ \"encoder\": [").is_err());
    }

    #[test]
    fn test_unbalanced_lists() {
        let err = load_temp(
            r#"{
                "encoder": [{ "filters": 4, "kernel_size": 3 }, { "filters": 8, "kernel_size": 3 }],
                "decoder": [{ "filters": 3, "kernel_size": 3 }]
            }"#,
        )
        .unwrap_err();
        assert!(err.contains("Encoder has 2 stages but decoder has 1"), "{}", err);
    }

    #[test]
    fn test_even_kernel() {
        let err = load_temp(
            r#"{
                "encoder": [{ "filters": 4, "kernel_size": 4 }],
                "decoder": [{ "filters": 3, "kernel_size": 3 }]
            }"#,
        )
        .unwrap_err();
        assert!(err.contains("Encoder stage 0: kernel_size must be odd, got 4"), "{}", err);
    }

    #[test]
    fn test_even_decoder_kernel() {
        let err = load_temp(
            r#"{
                "encoder": [{ "filters": 4, "kernel_size": 3 }],
                "decoder": [{ "filters": 3, "kernel_size": 2 }]
            }"#,
        )
        .unwrap_err();
        assert!(err.contains("Decoder stage 0"), "{}", err);
    }

    #[test]
    fn test_zero_filters() {
        let err = load_temp(
            r#"{
                "encoder": [{ "filters": 0, "kernel_size": 3 }],
                "decoder": [{ "filters": 3, "kernel_size": 3 }]
            }"#,
        )
        .unwrap_err();
        assert!(err.contains("filters must be positive"), "{}", err);
    }

    #[test]
    fn test_empty_encoder() {
        let err = load_temp(r#"{ "encoder": [], "decoder": [] }"#).unwrap_err();
        assert!(err.contains("at least one encoder stage"), "{}", err);
    }

    #[test]
    fn test_negative_alpha() {
        let mut config = default_architecture();
        config.leaky_relu_alpha = -0.5;
        assert!(validate_architecture(&config).is_err());
    }

    #[test]
    fn test_input_size_checks() {
        let config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
        assert!(validate_input_size(&config, 8, 12).is_ok());
        assert!(validate_input_size(&config, 6, 8).is_err());
        assert!(validate_input_size(&config, 0, 8).is_err());
    }
}
