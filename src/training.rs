//! Training loop
//!
//! `fit` pulls `(image, mask, ground_truth)` batches from any iterator, runs
//! one atomic train step per batch with Adam and reports each step to the
//! registered callbacks. A callback can stop training between steps.

use crate::config::TrainingConfig;
use crate::features::FeatureExtractor;
use crate::loss::{psnr, CompositeLoss, LossBreakdown};
use crate::network::PConvUNet;
use crate::optimizers::Adam;
use crate::tensor::Tensor4;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Instant;

/// One training example batch. `image` is usually `ground_truth` with the
/// holes blanked out.
#[derive(Debug, Clone)]
pub struct Batch {
    pub image: Tensor4,
    pub mask: Tensor4,
    pub ground_truth: Tensor4,
}

impl Batch {
    /// Build a batch by masking `ground_truth` with `mask`.
    pub fn from_ground_truth(ground_truth: Tensor4, mask: Tensor4) -> Self {
        let image = ground_truth.mul(&mask);
        Self {
            image,
            mask,
            ground_truth,
        }
    }
}

/// What happened in one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    /// 1-based step number
    pub step: usize,
    pub loss: LossBreakdown,
    /// PSNR of the prediction against the ground truth
    pub psnr: f32,
    pub learning_rate: f32,
    /// Seconds since `fit` started
    pub elapsed: f32,
}

/// Per-step metrics of a finished `fit` call.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub steps: Vec<StepMetrics>,
    /// True when a callback ended training early.
    pub stopped_early: bool,
}

impl TrainingHistory {
    pub fn losses(&self) -> Vec<f32> {
        self.steps.iter().map(|s| s.loss.total).collect()
    }

    pub fn last(&self) -> Option<&StepMetrics> {
        self.steps.last()
    }
}

/// Observer of the training loop.
pub trait TrainingCallback {
    /// Called after every step. Returning `ControlFlow::Break(())` stops training.
    fn on_step_end(&mut self, metrics: &StepMetrics) -> ControlFlow<()>;

    /// Called once after the last step.
    fn on_train_end(&mut self, _history: &TrainingHistory) {}
}

/// Writes `step,loss,psnr,time` lines to a CSV file.
pub struct LossLogger {
    writer: BufWriter<File>,
}

impl LossLogger {
    /// Create (or truncate) the log file, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "step,loss,psnr,time")?;
        Ok(Self { writer })
    }
}

impl TrainingCallback for LossLogger {
    fn on_step_end(&mut self, metrics: &StepMetrics) -> ControlFlow<()> {
        writeln!(
            self.writer,
            "{},{},{},{}",
            metrics.step, metrics.loss.total, metrics.psnr, metrics.elapsed
        )
        .ok();
        ControlFlow::Continue(())
    }

    fn on_train_end(&mut self, _history: &TrainingHistory) {
        self.writer.flush().ok();
    }
}

/// Stops training once the total loss is not finite.
#[derive(Debug, Default)]
pub struct StopOnNonFinite;

impl TrainingCallback for StopOnNonFinite {
    fn on_step_end(&mut self, metrics: &StepMetrics) -> ControlFlow<()> {
        if metrics.loss.total.is_finite() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }
}

/// Train `network` for up to `config.steps` batches.
///
/// Stops early when the iterator runs dry or a callback breaks. The network is
/// switched to training mode for the duration of the call and left there.
pub fn fit<I>(
    network: &mut PConvUNet,
    extractor: &dyn FeatureExtractor,
    loss: &CompositeLoss,
    batches: I,
    config: &TrainingConfig,
    callbacks: &mut [&mut dyn TrainingCallback],
) -> TrainingHistory
where
    I: IntoIterator<Item = Batch>,
{
    let mut optimizer = Adam::new(
        config.learning_rate,
        config.beta1,
        config.beta2,
        config.epsilon,
    );
    network.set_training(true);
    let mut history = TrainingHistory::default();
    let start = Instant::now();

    info!(
        "Training: steps={} lr={} parameters={}",
        config.steps,
        config.learning_rate,
        network.parameter_count()
    );

    for (index, batch) in batches.into_iter().take(config.steps).enumerate() {
        let (breakdown, prediction) = network.train_step(
            extractor,
            loss,
            &mut optimizer,
            &batch.image,
            &batch.mask,
            &batch.ground_truth,
        );

        let metrics = StepMetrics {
            step: index + 1,
            loss: breakdown,
            psnr: psnr(&batch.ground_truth, &prediction),
            learning_rate: config.learning_rate,
            elapsed: start.elapsed().as_secs_f32(),
        };
        debug!("step {}: {:?}", metrics.step, metrics.loss);
        if config.log_every > 0 && metrics.step % config.log_every == 0 {
            info!(
                "Step {} | loss={:.6} | psnr={:.2} | time={:.3}s",
                metrics.step, metrics.loss.total, metrics.psnr, metrics.elapsed
            );
        }
        history.steps.push(metrics);

        let mut stop = false;
        for callback in callbacks.iter_mut() {
            if callback.on_step_end(&metrics).is_break() {
                stop = true;
            }
        }
        if stop {
            info!("Training stopped by callback after step {}", metrics.step);
            history.stopped_early = true;
            break;
        }
    }

    for callback in callbacks.iter_mut() {
        callback.on_train_end(&history);
    }
    history
}
