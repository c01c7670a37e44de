// Tests for the training loop, its callbacks and the loss log.

use pconv_inpainting::architecture::{build_unet, load_architecture};
use pconv_inpainting::config::TrainingConfig;
use pconv_inpainting::features::VggFeatureExtractor;
use pconv_inpainting::loss::CompositeLoss;
use pconv_inpainting::mask::MaskGenerator;
use pconv_inpainting::network::PConvUNet;
use pconv_inpainting::tensor::{DataLayout, Tensor4};
use pconv_inpainting::training::{
    fit, Batch, LossLogger, StepMetrics, StopOnNonFinite, TrainingCallback, TrainingHistory,
};
use pconv_inpainting::utils::SimpleRng;
use std::fs;
use std::ops::ControlFlow;
use tempfile::TempDir;

fn tiny_network() -> PConvUNet {
    let config = load_architecture("config/architectures/pconv_unet_tiny.json").unwrap();
    build_unet(&config, 3, &mut SimpleRng::new(42)).unwrap()
}

fn batches(count: usize) -> Vec<Batch> {
    let generator = MaskGenerator::new(8, 8, 3).with_scale_ratio(0.3);
    let mut rng = SimpleRng::new(1);
    (0..count)
        .map(|i| {
            let gt = Tensor4::from_fn(2, 8, 8, 3, DataLayout::ChannelsLast, |b, y, x, c| {
                0.25 + 0.1 * c as f32 + 0.03 * ((x + 2 * y + b + i) % 5) as f32
            });
            let mask = generator.generate_batch(2, &mut rng, DataLayout::ChannelsLast);
            Batch::from_ground_truth(gt, mask)
        })
        .collect()
}

fn small_config(steps: usize) -> TrainingConfig {
    TrainingConfig {
        steps,
        batch_size: 2,
        learning_rate: 0.001,
        log_every: 0,
        ..TrainingConfig::default()
    }
}

/// Records every step and optionally stops after `stop_after` steps.
#[derive(Default)]
struct Recorder {
    steps: Vec<usize>,
    stop_after: Option<usize>,
    ended_with: Option<usize>,
}

impl TrainingCallback for Recorder {
    fn on_step_end(&mut self, metrics: &StepMetrics) -> ControlFlow<()> {
        self.steps.push(metrics.step);
        match self.stop_after {
            Some(n) if metrics.step >= n => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }

    fn on_train_end(&mut self, history: &TrainingHistory) {
        self.ended_with = Some(history.steps.len());
    }
}

// ============================================================================
// fit
// ============================================================================

#[test]
fn test_batch_from_ground_truth_blanks_holes() {
    let batch = &batches(1)[0];
    for idx in 0..batch.image.len() {
        let expected = batch.ground_truth.data()[idx] * batch.mask.data()[idx];
        assert_eq!(batch.image.data()[idx], expected);
    }
}

#[test]
fn test_fit_runs_configured_steps() {
    let mut network = tiny_network();
    let extractor = VggFeatureExtractor::random([4, 8, 8], 2);
    let mut recorder = Recorder::default();

    let history = fit(
        &mut network,
        &extractor,
        &CompositeLoss::default(),
        batches(10),
        &small_config(4),
        &mut [&mut recorder],
    );

    assert_eq!(history.steps.len(), 4);
    assert!(!history.stopped_early);
    assert_eq!(recorder.steps, vec![1, 2, 3, 4]);
    assert_eq!(recorder.ended_with, Some(4));
    assert_eq!(history.losses().len(), 4);
    assert!(history.losses().iter().all(|l| l.is_finite()));
    assert!(network.is_training());

    let last = history.last().unwrap();
    assert_eq!(last.step, 4);
    assert_eq!(last.learning_rate, 0.001);
    assert!(last.psnr.is_finite());
    assert!(last.elapsed >= 0.0);
}

#[test]
fn test_fit_stops_when_batches_run_out() {
    let mut network = tiny_network();
    let extractor = VggFeatureExtractor::random([4, 8, 8], 3);
    let history = fit(
        &mut network,
        &extractor,
        &CompositeLoss::default(),
        batches(2),
        &small_config(10),
        &mut [],
    );
    assert_eq!(history.steps.len(), 2);
    assert!(!history.stopped_early);
}

#[test]
fn test_callback_can_stop_training() {
    let mut network = tiny_network();
    let extractor = VggFeatureExtractor::random([4, 8, 8], 4);
    let mut stopper = Recorder {
        stop_after: Some(2),
        ..Recorder::default()
    };
    let mut observer = Recorder::default();

    let history = fit(
        &mut network,
        &extractor,
        &CompositeLoss::default(),
        batches(10),
        &small_config(10),
        &mut [&mut stopper, &mut observer],
    );

    assert_eq!(history.steps.len(), 2);
    assert!(history.stopped_early);
    // Every callback sees the final step before training ends
    assert_eq!(observer.steps, vec![1, 2]);
    assert_eq!(observer.ended_with, Some(2));
}

#[test]
fn test_fit_switches_network_to_training() {
    let mut network = tiny_network();
    network.set_training(false);
    let extractor = VggFeatureExtractor::random([4, 8, 8], 5);
    fit(
        &mut network,
        &extractor,
        &CompositeLoss::default(),
        batches(1),
        &small_config(1),
        &mut [],
    );
    assert!(network.is_training());
}

// ============================================================================
// Callbacks
// ============================================================================

fn metrics(step: usize, total: f32) -> StepMetrics {
    let mut m = StepMetrics {
        step,
        loss: Default::default(),
        psnr: 20.0,
        learning_rate: 0.001,
        elapsed: 0.5,
    };
    m.loss.total = total;
    m
}

#[test]
fn test_stop_on_non_finite() {
    let mut guard = StopOnNonFinite;
    assert!(guard.on_step_end(&metrics(1, 0.5)).is_continue());
    assert!(guard.on_step_end(&metrics(2, f32::NAN)).is_break());
    assert!(guard.on_step_end(&metrics(3, f32::INFINITY)).is_break());
}

#[test]
fn test_loss_logger_writes_csv() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("logs").join("loss.txt");

    let mut logger = LossLogger::create(&path).unwrap();
    assert!(logger.on_step_end(&metrics(1, 2.5)).is_continue());
    assert!(logger.on_step_end(&metrics(2, 1.25)).is_continue());
    logger.on_train_end(&TrainingHistory::default());

    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines, vec!["step,loss,psnr,time", "1,2.5,20,0.5", "2,1.25,20,0.5"]);
}

#[test]
fn test_loss_logger_during_fit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("train.csv");
    let mut logger = LossLogger::create(&path).unwrap();
    let mut network = tiny_network();
    let extractor = VggFeatureExtractor::random([4, 8, 8], 6);

    fit(
        &mut network,
        &extractor,
        &CompositeLoss::default(),
        batches(3),
        &small_config(3),
        &mut [&mut logger],
    );

    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 4);
    for (i, line) in lines[1..].iter().enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], (i + 1).to_string());
        assert!(fields[1].parse::<f32>().unwrap().is_finite());
    }
}
