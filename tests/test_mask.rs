// Tests for the random hole mask generator.

use pconv_inpainting::mask::{MaskGenerator, MaskShapes};
use pconv_inpainting::tensor::DataLayout;
use pconv_inpainting::utils::SimpleRng;

fn hole_fraction(data: &[f32]) -> f32 {
    data.iter().filter(|&&v| v == 0.0).count() as f32 / data.len() as f32
}

#[test]
fn test_mask_shape_and_values() {
    let generator = MaskGenerator::new(128, 96, 3);
    let mut rng = SimpleRng::new(42);
    let mask = generator.generate(&mut rng, DataLayout::ChannelsLast);

    assert_eq!(mask.dims(), (1, 128, 96, 3));
    assert!(mask.data().iter().all(|&v| v == 0.0 || v == 1.0));
}

#[test]
fn test_mask_has_holes_and_known_pixels() {
    let generator = MaskGenerator::new(256, 256, 3);
    let mut rng = SimpleRng::new(7);
    for _ in 0..5 {
        let mask = generator.generate(&mut rng, DataLayout::ChannelsLast);
        let fraction = hole_fraction(mask.data());
        assert!(fraction > 0.0, "mask has no holes");
        assert!(fraction < 1.0, "mask has no known pixels");
    }
}

#[test]
fn test_channels_share_the_pattern() {
    let generator = MaskGenerator::new(64, 64, 3);
    let mut rng = SimpleRng::new(3);
    let mask = generator.generate(&mut rng, DataLayout::ChannelsFirst);
    for y in 0..64 {
        for x in 0..64 {
            let v = mask.get(0, y, x, 0);
            assert_eq!(mask.get(0, y, x, 1), v);
            assert_eq!(mask.get(0, y, x, 2), v);
        }
    }
}

#[test]
fn test_same_seed_same_mask() {
    let generator = MaskGenerator::new(64, 64, 3);
    let a = generator.generate(&mut SimpleRng::new(11), DataLayout::ChannelsLast);
    let b = generator.generate(&mut SimpleRng::new(11), DataLayout::ChannelsLast);
    let c = generator.generate(&mut SimpleRng::new(12), DataLayout::ChannelsLast);
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_layout_does_not_change_pattern() {
    let generator = MaskGenerator::new(32, 48, 3);
    let last = generator.generate(&mut SimpleRng::new(5), DataLayout::ChannelsLast);
    let first = generator.generate(&mut SimpleRng::new(5), DataLayout::ChannelsFirst);
    assert_eq!(first.to_layout(DataLayout::ChannelsLast), last);
}

#[test]
fn test_batch_masks_are_independent() {
    let generator = MaskGenerator::new(64, 64, 1);
    let mut rng = SimpleRng::new(9);
    let batch = generator.generate_batch(3, &mut rng, DataLayout::ChannelsLast);
    assert_eq!(batch.dims(), (3, 64, 64, 1));

    let sample = |b: usize| batch.data()[b * 64 * 64..(b + 1) * 64 * 64].to_vec();
    assert_ne!(sample(0), sample(1));
    assert_ne!(sample(1), sample(2));
}

#[test]
fn test_no_shapes_gives_full_mask() {
    let shapes = MaskShapes {
        lines: false,
        circles: false,
        ellipses: false,
        rectangles: false,
    };
    let generator = MaskGenerator::new(32, 32, 3).with_shapes(shapes);
    let mask = generator.generate(&mut SimpleRng::new(1), DataLayout::ChannelsLast);
    assert!(mask.data().iter().all(|&v| v == 1.0));
}

#[test]
fn test_rectangles_only() {
    let shapes = MaskShapes {
        lines: false,
        circles: false,
        ellipses: false,
        rectangles: true,
    };
    let generator = MaskGenerator::new(64, 64, 3).with_shapes(shapes);
    let mask = generator.generate(&mut SimpleRng::new(2), DataLayout::ChannelsLast);
    assert!(hole_fraction(mask.data()) > 0.0);
}

#[test]
fn test_wider_strokes_cover_more() {
    // Averaged over several draws, a larger scale ratio leaves fewer known pixels.
    let thin = MaskGenerator::new(128, 128, 1).with_scale_ratio(0.03);
    let thick = MaskGenerator::new(128, 128, 1).with_scale_ratio(0.15);
    let mut thin_total = 0.0;
    let mut thick_total = 0.0;
    for seed in 1..=8 {
        thin_total += hole_fraction(thin.generate(&mut SimpleRng::new(seed), DataLayout::ChannelsLast).data());
        thick_total += hole_fraction(thick.generate(&mut SimpleRng::new(seed), DataLayout::ChannelsLast).data());
    }
    assert!(thick_total > thin_total);
}
