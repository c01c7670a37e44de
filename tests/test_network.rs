// Tests for the partial-convolution U-Net: shapes, modes and training steps.

use pconv_inpainting::architecture::{build_unet, load_architecture, ArchitectureConfig, StageConfig};
use pconv_inpainting::features::VggFeatureExtractor;
use pconv_inpainting::loss::{CompositeLoss, LossWeights};
use pconv_inpainting::network::PConvUNet;
use pconv_inpainting::optimizers::Adam;
use pconv_inpainting::tensor::{DataLayout, Tensor4};
use pconv_inpainting::utils::SimpleRng;

fn tiny_network(seed: u64) -> PConvUNet {
    let config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
    let mut rng = SimpleRng::new(seed);
    build_unet(&config, 3, &mut rng).unwrap()
}

fn scene(batch: usize, size: usize, layout: DataLayout) -> (Tensor4, Tensor4, Tensor4) {
    let gt = Tensor4::from_fn(batch, size, size, 3, layout, |b, y, x, c| {
        0.2 + 0.05 * c as f32 + 0.02 * ((x + y + b) % 4) as f32
    });
    let mask = Tensor4::from_fn(batch, size, size, 3, layout, |_, y, x, _| {
        if (2..5).contains(&y) && (3..6).contains(&x) {
            0.0
        } else {
            1.0
        }
    });
    let image = gt.mul(&mask);
    (image, mask, gt)
}

// ============================================================================
// Forward
// ============================================================================

#[test]
fn test_prediction_shape_and_range() {
    let network = tiny_network(1);
    let (image, mask, _) = scene(2, 8, DataLayout::ChannelsLast);
    let (prediction, final_mask) = network.forward(&image, &mask);

    assert_eq!(prediction.dims(), (2, 8, 8, 3));
    assert_eq!(final_mask.dims(), (2, 8, 8, 3));
    assert!(prediction.data().iter().all(|&v| v > 0.0 && v < 1.0));
    assert!(final_mask.data().iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn test_final_mask_fills_small_holes() {
    // A 3x3 hole is covered after a depth-2 encoder/decoder pass.
    let network = tiny_network(2);
    let (image, mask, _) = scene(1, 8, DataLayout::ChannelsLast);
    let (_, final_mask) = network.forward(&image, &mask);
    assert!(final_mask.data().iter().all(|&v| v == 1.0));
}

#[test]
fn test_channels_first_matches_channels_last() {
    let network = tiny_network(3);
    let (image, mask, _) = scene(2, 8, DataLayout::ChannelsLast);
    let last = network.predict(&image, &mask);
    let first = network.predict(
        &image.to_layout(DataLayout::ChannelsFirst),
        &mask.to_layout(DataLayout::ChannelsFirst),
    );
    assert_eq!(first.layout(), DataLayout::ChannelsFirst);
    let first = first.to_layout(DataLayout::ChannelsLast);
    for (a, b) in last.data().iter().zip(first.data()) {
        approx::assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn test_rectangular_images() {
    let network = tiny_network(4);
    let image = Tensor4::filled(1, 8, 12, 3, DataLayout::ChannelsLast, 0.3);
    let mask = Tensor4::filled(1, 8, 12, 3, DataLayout::ChannelsLast, 1.0);
    assert_eq!(network.predict(&image, &mask).dims(), (1, 8, 12, 3));
}

#[test]
fn test_same_seed_same_network() {
    let (image, mask, _) = scene(1, 8, DataLayout::ChannelsLast);
    let a = tiny_network(9).predict(&image, &mask);
    let b = tiny_network(9).predict(&image, &mask);
    assert_eq!(a, b);
}

#[test]
fn test_inference_is_repeatable() {
    let mut network = tiny_network(5);
    network.set_training(false);
    assert!(!network.is_training());
    let (image, mask, _) = scene(2, 8, DataLayout::ChannelsLast);
    let first = network.predict(&image, &mask);
    let second = network.predict(&image, &mask);
    assert_eq!(first, second);
}

#[test]
fn test_output_channels_follow_configuration() {
    let config = ArchitectureConfig {
        encoder: vec![StageConfig::new(4, 3, false)],
        decoder: vec![StageConfig::new(4, 3, false)],
        train_encoder_bn: true,
        output_channels: 1,
        leaky_relu_alpha: 0.2,
    };
    let mut rng = SimpleRng::new(6);
    let network = build_unet(&config, 3, &mut rng).unwrap();
    let image = Tensor4::filled(1, 4, 4, 3, DataLayout::ChannelsLast, 0.5);
    assert_eq!(network.predict(&image, &image.map(|_| 1.0)).dims(), (1, 4, 4, 1));
}

#[test]
fn test_parameter_count_of_tiny_network() {
    let network = tiny_network(7);
    // enc0: 3*3*3*4 + 4
    // enc1: 3*3*4*8 + 8 + bn 16
    // dec0: 3*3*12*4 + 4 + bn 8
    // dec1: 3*3*7*3 + 3
    // out:  3*3 + 3
    let expected = (108 + 4) + (288 + 8 + 16) + (432 + 4 + 8) + (189 + 3) + (9 + 3);
    assert_eq!(network.parameter_count(), expected);
}

#[test]
#[should_panic(expected = "expects 3 channels")]
fn test_wrong_channel_count_panics() {
    let network = tiny_network(8);
    let image = Tensor4::zeros(1, 8, 8, 1, DataLayout::ChannelsLast);
    network.predict(&image, &image);
}

// ============================================================================
// Training
// ============================================================================

#[test]
fn test_train_step_reduces_pixel_loss() {
    let mut network = tiny_network(10);
    let extractor = VggFeatureExtractor::random([4, 8, 8], 3);
    let loss = CompositeLoss::new(LossWeights {
        perceptual: 0.0,
        style: 0.0,
        tv: 0.0,
        ..LossWeights::default()
    });
    let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-7);
    let (image, mask, gt) = scene(2, 8, DataLayout::ChannelsLast);

    let mut losses = Vec::new();
    for _ in 0..30 {
        let (breakdown, prediction) =
            network.train_step(&extractor, &loss, &mut optimizer, &image, &mask, &gt);
        assert_eq!(prediction.dims(), gt.dims());
        assert!(breakdown.total.is_finite());
        losses.push(breakdown.total);
    }
    let first = losses[0];
    let last = losses[losses.len() - 1];
    assert!(last < first, "loss did not decrease: {} -> {}", first, last);
}

#[test]
fn test_full_objective_train_steps_stay_finite() {
    let mut network = tiny_network(11);
    let extractor = VggFeatureExtractor::random([4, 8, 8], 4);
    let loss = CompositeLoss::default();
    let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-7);
    let (image, mask, gt) = scene(2, 8, DataLayout::ChannelsFirst);

    let before = network.predict(&image, &mask);
    for _ in 0..3 {
        let (breakdown, _) =
            network.train_step(&extractor, &loss, &mut optimizer, &image, &mask, &gt);
        assert!(breakdown.total.is_finite());
        assert!(breakdown.hole >= 0.0 && breakdown.style_pred >= 0.0);
    }
    let after = network.predict(&image, &mask);
    assert_ne!(before, after);
    // Every trainable tensor received an update
    assert_eq!(optimizer.slot_count(), 14);
}

#[test]
fn test_frozen_encoder_normalisation_trains() {
    let mut config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
    config.train_encoder_bn = false;
    let mut rng = SimpleRng::new(12);
    let mut network = build_unet(&config, 3, &mut rng).unwrap();
    let extractor = VggFeatureExtractor::random([4, 8, 8], 5);
    let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-7);
    let (image, mask, gt) = scene(1, 8, DataLayout::ChannelsLast);

    let (breakdown, _) = network.train_step(
        &extractor,
        &CompositeLoss::default(),
        &mut optimizer,
        &image,
        &mask,
        &gt,
    );
    assert!(breakdown.total.is_finite());
}
