// inpaint_train.rs
// Trains the partial-convolution U-Net on synthetic images with random hole
// masks, on the CPU.
//
// Usage:
//   inpaint_train [config.json]      (default: config/inpaint_default.json)
//
// Output:
//   - logs/training_loss_pconv.txt (step,loss,psnr,time)
//   - prints the hole-region PSNR of a held-out batch before and after training
//
// Set RUST_LOG=info (or debug) for progress logs.

use log::info;
use pconv_inpainting::architecture::build_unet;
use pconv_inpainting::config::{load_config, InpaintConfig};
use pconv_inpainting::features::VggFeatureExtractor;
use pconv_inpainting::loss::{psnr, CompositeLoss};
use pconv_inpainting::mask::MaskGenerator;
use pconv_inpainting::network::PConvUNet;
use pconv_inpainting::tensor::{DataLayout, Tensor4};
use pconv_inpainting::training::{fit, Batch, LossLogger, StopOnNonFinite, TrainingCallback};
use pconv_inpainting::utils::SimpleRng;
use std::process;

const DEFAULT_CONFIG: &str = "config/inpaint_default.json";
const LOG_PATH: &str = "./logs/training_loss_pconv.txt";

/// Endless stream of smooth random images with random hole masks.
struct SyntheticBatches {
    rng: SimpleRng,
    masks: MaskGenerator,
    batch_size: usize,
    height: usize,
    width: usize,
    layout: DataLayout,
}

impl SyntheticBatches {
    fn new(config: &InpaintConfig, seed: u64) -> Self {
        Self {
            rng: SimpleRng::new(seed),
            masks: MaskGenerator::new(
                config.image_height,
                config.image_width,
                config.image_channels,
            ),
            batch_size: config.training.batch_size,
            height: config.image_height,
            width: config.image_width,
            layout: config.data_layout,
        }
    }

    /// Sum of two random colour waves, in [0, 1].
    fn images(&mut self) -> Tensor4 {
        let params: Vec<[f32; 9]> = (0..self.batch_size)
            .map(|_| {
                let mut p = [0.0f32; 9];
                for v in p.iter_mut() {
                    *v = self.rng.next_f32();
                }
                p
            })
            .collect();
        let (h, w) = (self.height as f32, self.width as f32);
        Tensor4::from_fn(
            self.batch_size,
            self.height,
            self.width,
            3,
            self.layout,
            |b, y, x, c| {
                let p = &params[b];
                let fy = 1.0 + 4.0 * p[0];
                let fx = 1.0 + 4.0 * p[1];
                let phase = 6.28 * p[2 + c];
                let wave = (fy * y as f32 / h * 6.28 + phase).sin() * (fx * x as f32 / w * 6.28).cos();
                (0.5 + 0.25 * wave + 0.2 * (p[5 + c] - 0.5)).clamp(0.0, 1.0)
            },
        )
    }

    fn batch(&mut self) -> Batch {
        let ground_truth = self.images();
        let mask = self
            .masks
            .generate_batch(self.batch_size, &mut self.rng, self.layout);
        Batch::from_ground_truth(ground_truth, mask)
    }
}

impl Iterator for SyntheticBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        Some(self.batch())
    }
}

fn evaluate(network: &PConvUNet, batch: &Batch) -> f32 {
    let prediction = network.predict(&batch.image, &batch.mask);
    let holes = batch.mask.map(|m| 1.0 - m);
    psnr(&batch.ground_truth.mul(&holes), &prediction.mul(&holes))
}

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = load_config(&path).unwrap_or_else(|e| {
        eprintln!("Could not load config {}: {}", path, e);
        process::exit(1);
    });
    let architecture = config.resolve_architecture().unwrap_or_else(|e| {
        eprintln!("Invalid architecture: {}", e);
        process::exit(1);
    });

    let extractor = VggFeatureExtractor::load_or_random(
        config.feature_weights.as_deref(),
        config.feature_channels,
        config.feature_seed,
    )
    .unwrap_or_else(|e| {
        eprintln!("Could not load feature extractor: {}", e);
        process::exit(1);
    });

    let mut rng = SimpleRng::new(config.training.seed);
    let mut network = build_unet(&architecture, config.image_channels, &mut rng)
        .unwrap_or_else(|e| {
            eprintln!("Could not build network: {}", e);
            process::exit(1);
        });
    println!(
        "Network: depth={} parameters={} image={}x{}x{} layout={:?}",
        network.depth(),
        network.parameter_count(),
        config.image_height,
        config.image_width,
        config.image_channels,
        config.data_layout
    );

    let test_batch = SyntheticBatches::new(&config, config.training.seed.wrapping_add(1)).batch();
    network.set_training(false);
    println!("Hole PSNR before training: {:.2} dB", evaluate(&network, &test_batch));

    let mut logger = LossLogger::create(LOG_PATH).unwrap_or_else(|_| {
        eprintln!("Could not create {}", LOG_PATH);
        process::exit(1);
    });
    let mut guard = StopOnNonFinite;
    let loss = CompositeLoss::new(config.loss_weights);
    let batches = SyntheticBatches::new(&config, config.training.seed);

    println!(
        "Training: steps={} batch={} lr={}",
        config.training.steps, config.training.batch_size, config.training.learning_rate
    );
    let mut callbacks: [&mut dyn TrainingCallback; 2] = [&mut logger, &mut guard];
    let history = fit(
        &mut network,
        &extractor,
        &loss,
        batches,
        &config.training,
        &mut callbacks,
    );
    if let Some(last) = history.last() {
        info!("Final step {}: {:?}", last.step, last.loss);
        println!(
            "Trained {} steps | loss={:.6} | psnr={:.2} | time={:.3}s",
            last.step, last.loss.total, last.psnr, last.elapsed
        );
    }

    network.set_training(false);
    println!("Hole PSNR after training: {:.2} dB", evaluate(&network, &test_batch));
}
