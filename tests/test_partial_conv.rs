// Tests for the partial convolution operator: mask propagation, renormalisation
// and analytic gradients against finite differences.

use approx::assert_relative_eq;
use pconv_inpainting::layers::{PConvConfig, PartialConv2D};
use pconv_inpainting::tensor::{DataLayout, Tensor4};
use pconv_inpainting::utils::{Activation, Initializer, SimpleRng};

fn random_tensor(rng: &mut SimpleRng, b: usize, h: usize, w: usize, c: usize) -> Tensor4 {
    Tensor4::from_fn(b, h, w, c, DataLayout::ChannelsLast, |_, _, _, _| {
        rng.gen_range_f32(-1.0, 1.0)
    })
}

fn random_mask(rng: &mut SimpleRng, b: usize, h: usize, w: usize, c: usize) -> Tensor4 {
    Tensor4::from_fn(b, h, w, c, DataLayout::ChannelsLast, |_, _, _, _| {
        if rng.next_f32() < 0.6 {
            1.0
        } else {
            0.0
        }
    })
}

// L = Σ r · output, a smooth scalar of the layer output.
fn weighted_sum(output: &Tensor4, r: &Tensor4) -> f64 {
    output
        .data()
        .iter()
        .zip(r.data())
        .map(|(&o, &w)| o as f64 * w as f64)
        .sum()
}

// ============================================================================
// Forward properties
// ============================================================================

#[test]
fn test_full_resolution_scenario_shapes() {
    // 256x256x3 image, all-ones mask, 64 filters, kernel 7, stride 2
    let mut rng = SimpleRng::new(42);
    let config = PConvConfig::new(64, 7).with_stride(2);
    let layer = PartialConv2D::new(config, 3, &mut rng);
    let image = Tensor4::filled(1, 256, 256, 3, DataLayout::ChannelsLast, 0.5);
    let mask = Tensor4::filled(1, 256, 256, 3, DataLayout::ChannelsLast, 1.0);

    let out = layer.forward(&image, &mask);
    assert_eq!(out.image.dims(), (1, 128, 128, 64));
    assert_eq!(out.mask.dims(), (1, 128, 128, 64));
    assert!(out.mask.data().iter().all(|&m| m == 1.0));
}

#[test]
fn test_output_dims_are_ceil_of_stride() {
    let mut rng = SimpleRng::new(1);
    for (size, stride, expected) in [(7, 2, 4), (9, 3, 3), (5, 1, 5), (1, 2, 1)] {
        let layer = PartialConv2D::new(PConvConfig::new(2, 3).with_stride(stride), 1, &mut rng);
        let image = Tensor4::zeros(1, size, size, 1, DataLayout::ChannelsLast);
        let mask = Tensor4::filled(1, size, size, 1, DataLayout::ChannelsLast, 1.0);
        let out = layer.forward(&image, &mask);
        assert_eq!(out.image.height(), expected);
        assert_eq!(out.image.width(), expected);
    }
}

#[test]
fn test_binary_masks_stay_binary() {
    let mut rng = SimpleRng::new(2);
    let layer = PartialConv2D::new(PConvConfig::new(3, 5).with_stride(2), 2, &mut rng);
    let image = random_tensor(&mut rng, 2, 10, 10, 2);
    let mask = random_mask(&mut rng, 2, 10, 10, 2);

    let out = layer.forward(&image, &mask);
    assert!(out.mask.data().iter().all(|&m| m == 0.0 || m == 1.0));
}

#[test]
fn test_fractional_masks_are_clipped() {
    let mut rng = SimpleRng::new(3);
    let layer = PartialConv2D::new(PConvConfig::new(2, 3), 1, &mut rng);
    let image = random_tensor(&mut rng, 1, 6, 6, 1);
    let mask = Tensor4::filled(1, 6, 6, 1, DataLayout::ChannelsLast, 0.05);

    let out = layer.forward(&image, &mask);
    for &m in out.mask.data() {
        assert!((0.0..=1.0).contains(&m));
    }
    // A full window holds 9 * 0.05 = 0.45 of coverage
    assert_relative_eq!(out.mask.get(0, 3, 3, 0), 0.45, epsilon = 1e-6);
}

#[test]
fn test_zero_coverage_output_is_activation_of_bias() {
    let mut rng = SimpleRng::new(4);
    let config = PConvConfig::new(3, 3)
        .with_activation(Activation::Relu)
        .with_bias_initializer(Initializer::Constant { value: -0.25 });
    let layer = PartialConv2D::new(config, 2, &mut rng);
    let image = random_tensor(&mut rng, 1, 8, 8, 2);
    // Hole covering the left half; columns 0..=2 see no valid pixel with k = 3
    let mask = Tensor4::from_fn(1, 8, 8, 2, DataLayout::ChannelsLast, |_, _, x, _| {
        if x < 4 {
            0.0
        } else {
            1.0
        }
    });

    let out = layer.forward(&image, &mask);
    for y in 0..8 {
        for x in 0..3 {
            for c in 0..3 {
                assert_eq!(out.mask.get(0, y, x, c), 0.0);
                assert_eq!(out.image.get(0, y, x, c), 0.0); // relu(-0.25)
            }
        }
    }
}

#[test]
fn test_layouts_agree() {
    let mut rng = SimpleRng::new(5);
    let layer = PartialConv2D::new(PConvConfig::new(4, 3).with_stride(2), 3, &mut rng);
    let image = random_tensor(&mut rng, 2, 8, 6, 3);
    let mask = random_mask(&mut rng, 2, 8, 6, 3);

    let last = layer.forward(&image, &mask);
    let first = layer.forward(
        &image.to_layout(DataLayout::ChannelsFirst),
        &mask.to_layout(DataLayout::ChannelsFirst),
    );
    assert_eq!(first.image.layout(), DataLayout::ChannelsFirst);
    let first_image = first.image.to_layout(DataLayout::ChannelsLast);
    for (a, b) in last.image.data().iter().zip(first_image.data()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
    assert_eq!(first.mask.to_layout(DataLayout::ChannelsLast), last.mask);
}

#[test]
fn test_renormalisation_compensates_missing_pixels() {
    // Constant image: a partially covered window must give the same output
    // as a fully covered one.
    let kernel = vec![0.5f32; 9];
    let config = PConvConfig::new(1, 3).with_bias(false);
    let layer = PartialConv2D::from_parameters(config, 1, kernel, None);
    let image = Tensor4::filled(1, 5, 5, 1, DataLayout::ChannelsLast, 2.0);
    let mut mask = Tensor4::filled(1, 5, 5, 1, DataLayout::ChannelsLast, 1.0);
    mask.set(0, 1, 1, 0, 0.0);
    mask.set(0, 2, 1, 0, 0.0);

    let out = layer.forward(&image, &mask);
    // full window: 9 * 0.5 * 2
    assert_relative_eq!(out.image.get(0, 3, 3, 0), 9.0, epsilon = 1e-4);
    assert_relative_eq!(out.image.get(0, 2, 2, 0), 9.0, epsilon = 1e-4);
}

// ============================================================================
// Gradient checks
// ============================================================================

fn check_gradients(activation: Activation, use_bias: bool, h: f32, tolerance: f64) {
    let mut rng = SimpleRng::new(11);
    let config = PConvConfig::new(2, 3)
        .with_stride(2)
        .with_bias(use_bias)
        .with_activation(activation)
        .with_bias_initializer(Initializer::Constant { value: 0.1 });
    let layer = PartialConv2D::new(config, 2, &mut rng);
    let image = random_tensor(&mut rng, 2, 6, 6, 2);
    let mask = random_mask(&mut rng, 2, 6, 6, 2);
    let r = random_tensor(&mut rng, 2, 3, 3, 2);

    let (_, trace) = layer.forward_trace(&image, &mask);
    let grad_image = layer.backward(&trace, &r);
    let grad_weights = layer.weight_gradients();

    // Weights
    for k in (0..layer.weights().len()).step_by(5) {
        let mut plus = layer.weights().to_vec();
        let mut minus = layer.weights().to_vec();
        plus[k] += h;
        minus[k] -= h;
        let bias = layer.bias().map(|b| b.to_vec());
        let lp = PartialConv2D::from_parameters(config, 2, plus, bias.clone());
        let lm = PartialConv2D::from_parameters(config, 2, minus, bias);
        let numerical = (weighted_sum(&lp.forward(&image, &mask).image, &r)
            - weighted_sum(&lm.forward(&image, &mask).image, &r))
            / (2.0 * h as f64);
        let analytical = grad_weights[k] as f64;
        assert!(
            (numerical - analytical).abs() <= tolerance * (1.0 + analytical.abs()),
            "weight {}: numerical {} vs analytical {}",
            k,
            numerical,
            analytical
        );
    }

    // Bias
    if use_bias {
        let grad_bias = layer.bias_gradients();
        for c in 0..2 {
            let mut plus = vec![0.1f32; 2];
            let mut minus = vec![0.1f32; 2];
            plus[c] += h;
            minus[c] -= h;
            let lp = PartialConv2D::from_parameters(config, 2, layer.weights().to_vec(), Some(plus));
            let lm = PartialConv2D::from_parameters(config, 2, layer.weights().to_vec(), Some(minus));
            let numerical = (weighted_sum(&lp.forward(&image, &mask).image, &r)
                - weighted_sum(&lm.forward(&image, &mask).image, &r))
                / (2.0 * h as f64);
            assert!(
                (numerical - grad_bias[c] as f64).abs() <= tolerance * (1.0 + numerical.abs()),
                "bias {}: numerical {} vs analytical {}",
                c,
                numerical,
                grad_bias[c]
            );
        }
    }

    // Input image
    for idx in (0..image.len()).step_by(7) {
        let mut plus = image.clone();
        let mut minus = image.clone();
        plus.data_mut()[idx] += h;
        minus.data_mut()[idx] -= h;
        let numerical = (weighted_sum(&layer.forward(&plus, &mask).image, &r)
            - weighted_sum(&layer.forward(&minus, &mask).image, &r))
            / (2.0 * h as f64);
        let analytical = grad_image.data()[idx] as f64;
        assert!(
            (numerical - analytical).abs() <= tolerance * (1.0 + analytical.abs()),
            "input {}: numerical {} vs analytical {}",
            idx,
            numerical,
            analytical
        );
        if mask.data()[idx] == 0.0 {
            assert_eq!(analytical, 0.0);
        }
    }
}

#[test]
fn test_gradients_linear_activation() {
    check_gradients(Activation::Linear, true, 1e-2, 1e-3);
}

#[test]
fn test_gradients_sigmoid_activation() {
    check_gradients(Activation::Sigmoid, true, 1e-3, 1e-2);
}

#[test]
fn test_gradients_without_bias() {
    check_gradients(Activation::Linear, false, 1e-2, 1e-3);
}

#[test]
fn test_update_consumes_gradients() {
    use pconv_inpainting::optimizers::Adam;

    let mut rng = SimpleRng::new(12);
    let mut layer = PartialConv2D::new(PConvConfig::new(2, 3), 1, &mut rng);
    let image = random_tensor(&mut rng, 1, 4, 4, 1);
    let mask = Tensor4::filled(1, 4, 4, 1, DataLayout::ChannelsLast, 1.0);
    let (out, trace) = layer.forward_trace(&image, &mask);
    layer.backward(&trace, &out.image.map(|_| 1.0));

    let before = layer.weights().to_vec();
    let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-8);
    let mut slot = 0;
    layer.update_with_optimizer(&mut optimizer, &mut slot);

    assert_eq!(slot, 2);
    assert_ne!(layer.weights(), before.as_slice());
    assert!(layer.weight_gradients().iter().all(|&g| g == 0.0));
    assert!(layer.bias_gradients().iter().all(|&g| g == 0.0));
}
