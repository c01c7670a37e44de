//! Partial-convolution U-Net
//!
//! ```text
//! (image, mask) ─ enc0 ─ enc1 ─ … ─ enc(d-1)
//!       │          │                  │
//!       │          │                dec0 (up ×2, concat enc(d-2))
//!       │          └────────────── dec(d-2) (up ×2, concat enc0)
//!       └───────────────────────── dec(d-1) (up ×2, concat input)
//!                                     │
//!                               1x1 conv + sigmoid
//! ```
//!
//! Encoder stage: partial conv (stride 2) → optional batch norm → ReLU.
//! Decoder stage: nearest ×2 upsampling of image and mask, channel concat with
//! the skip pair of matching resolution, partial conv (stride 1) → optional
//! batch norm → LeakyReLU.
//!
//! Forward passes are functions of the parameters and the inputs. The
//! training pass returns an explicit trace which `backward` consumes;
//! applying the accumulated gradients is a separate call.

use crate::architecture::ArchitectureConfig;
use crate::features::FeatureExtractor;
use crate::layers::sampling::{upsample_nearest2x, upsample_nearest2x_backward};
use crate::layers::{
    BatchNorm2D, Conv2DLayer, Layer, PConvConfig, PConvOutput, PConvTrace, PartialConv2D,
};
use crate::loss::{CompositeLoss, LossBreakdown};
use crate::optimizers::Optimizer;
use crate::tensor::Tensor4;
use crate::utils::activations::sigmoid;
use crate::utils::{Activation, SimpleRng};
use log::debug;

struct Stage {
    pconv: PartialConv2D,
    bn: Option<BatchNorm2D>,
    activation: Activation,
}

/// What one stage keeps for its backward pass.
#[derive(Debug, Clone)]
pub struct StageTrace {
    pconv: PConvTrace,
    /// Partial-convolution output (batch-norm input).
    conv_output: Tensor4,
    /// Activation input.
    pre_activation: Tensor4,
    /// Channels of the upsampled part of a decoder stage's input.
    upsampled_channels: usize,
}

/// Everything `backward` needs from one training forward pass.
#[derive(Debug, Clone)]
pub struct NetworkTrace {
    encoder: Vec<StageTrace>,
    decoder: Vec<StageTrace>,
    output_input: Tensor4,
    output_pre_activation: Tensor4,
    /// Sigmoid output.
    pub prediction: Tensor4,
    /// Mask after the last decoder stage.
    pub mask: Tensor4,
}

impl Stage {
    fn new(
        config: PConvConfig,
        in_channels: usize,
        batch_norm: bool,
        activation: Activation,
        rng: &mut SimpleRng,
    ) -> Self {
        let filters = config.filters;
        Self {
            pconv: PartialConv2D::new(config, in_channels, rng),
            bn: batch_norm.then(|| BatchNorm2D::with_defaults(filters)),
            activation,
        }
    }

    fn forward(
        &self,
        image: &Tensor4,
        mask: &Tensor4,
        use_batch_stats: bool,
    ) -> (PConvOutput, StageTrace) {
        let (out, pconv) = self.pconv.forward_trace(image, mask);
        let pre_activation = match &self.bn {
            Some(bn) => bn.forward_mode(&out.image, use_batch_stats),
            None => out.image.clone(),
        };
        let mut activated = pre_activation.clone();
        self.activation.apply_inplace(activated.data_mut());

        let trace = StageTrace {
            pconv,
            conv_output: out.image,
            pre_activation,
            upsampled_channels: 0,
        };
        (
            PConvOutput {
                image: activated,
                mask: out.mask,
            },
            trace,
        )
    }

    fn backward(&self, trace: &StageTrace, grad_output: &Tensor4) -> Tensor4 {
        let mut grad = grad_output.clone();
        self.activation
            .backward_inplace(trace.pre_activation.data(), grad.data_mut());
        if let Some(bn) = &self.bn {
            grad = bn.backward(&trace.conv_output, &grad);
        }
        self.pconv.backward(&trace.pconv, &grad)
    }

    fn update(&mut self, optimizer: &mut dyn Optimizer, slot: &mut usize) {
        self.pconv.update_with_optimizer(optimizer, slot);
        if let Some(bn) = self.bn.as_mut() {
            bn.update_with_optimizer(optimizer, slot);
        }
    }

    fn parameter_count(&self) -> usize {
        self.pconv.parameter_count() + self.bn.as_ref().map_or(0, |bn| bn.parameter_count())
    }

    fn set_training(&mut self, training: bool) {
        if let Some(bn) = self.bn.as_mut() {
            bn.set_training(training);
        }
    }
}

/// Encoder/decoder inpainting network.
pub struct PConvUNet {
    in_channels: usize,
    encoder: Vec<Stage>,
    decoder: Vec<Stage>,
    output: Conv2DLayer,
    train_encoder_bn: bool,
    training: bool,
}

impl PConvUNet {
    /// Build the network for `in_channels`-channel images.
    ///
    /// # Panics
    ///
    /// Panics if the encoder and decoder lists differ in length or are empty.
    /// Use `architecture::build_unet` for a validated construction.
    pub fn new(config: &ArchitectureConfig, in_channels: usize, rng: &mut SimpleRng) -> Self {
        let depth = config.encoder.len();
        assert!(depth > 0, "architecture needs at least one encoder stage");
        assert_eq!(
            depth,
            config.decoder.len(),
            "encoder and decoder must have the same number of stages"
        );

        let mut encoder = Vec::with_capacity(depth);
        let mut channels = in_channels;
        let mut skip_channels = vec![in_channels];
        for stage in &config.encoder {
            let pconv = PConvConfig::new(stage.filters, stage.kernel_size).with_stride(2);
            encoder.push(Stage::new(pconv, channels, stage.batch_norm, Activation::Relu, rng));
            channels = stage.filters;
            skip_channels.push(stage.filters);
        }

        let decoder_activation = Activation::LeakyRelu {
            alpha: config.leaky_relu_alpha,
        };
        let mut decoder = Vec::with_capacity(depth);
        for (i, stage) in config.decoder.iter().enumerate() {
            let skip = skip_channels[depth - 1 - i];
            let pconv = PConvConfig::new(stage.filters, stage.kernel_size);
            decoder.push(Stage::new(
                pconv,
                channels + skip,
                stage.batch_norm,
                decoder_activation,
                rng,
            ));
            channels = stage.filters;
        }

        let output = Conv2DLayer::new(channels, config.output_channels, 1, 1, rng);

        let network = Self {
            in_channels,
            encoder,
            decoder,
            output,
            train_encoder_bn: config.train_encoder_bn,
            training: true,
        };
        debug!(
            "PConvUNet: depth {}, {} input channels, {} parameters",
            depth,
            in_channels,
            network.parameter_count()
        );
        network
    }

    pub fn depth(&self) -> usize {
        self.encoder.len()
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output.out_channels()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Training mode: decoder batch norm uses batch statistics and running
    /// statistics are updated. Encoder batch norm uses batch statistics when
    /// `train_encoder_bn` is set and running statistics otherwise, whatever
    /// the mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for stage in self.encoder.iter_mut().chain(self.decoder.iter_mut()) {
            stage.set_training(training);
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.encoder
            .iter()
            .chain(self.decoder.iter())
            .map(Stage::parameter_count)
            .sum::<usize>()
            + self.output.parameter_count()
    }

    fn check_inputs(&self, image: &Tensor4, mask: &Tensor4) {
        image.assert_same_dims(mask, "PConvUNet image/mask");
        assert_eq!(
            image.channels(),
            self.in_channels,
            "PConvUNet expects {} channels, got {}",
            self.in_channels,
            image.channels()
        );
        let factor = 1usize << self.depth();
        assert!(
            image.height() % factor == 0 && image.width() % factor == 0,
            "image size {}x{} must be divisible by {}",
            image.height(),
            image.width(),
            factor
        );
    }

    /// Prediction and final propagated mask.
    pub fn forward(&self, image: &Tensor4, mask: &Tensor4) -> (Tensor4, Tensor4) {
        let trace = self.forward_train(image, mask);
        (trace.prediction, trace.mask)
    }

    /// Inpainted image, same spatial size as `image`, `output_channels` channels.
    pub fn predict(&self, image: &Tensor4, mask: &Tensor4) -> Tensor4 {
        self.forward(image, mask).0
    }

    /// Forward pass keeping every intermediate needed by `backward`.
    pub fn forward_train(&self, image: &Tensor4, mask: &Tensor4) -> NetworkTrace {
        self.check_inputs(image, mask);
        // Set: always batch statistics. Unset: encoder normalisation frozen
        let encoder_batch_stats = self.train_encoder_bn;

        let mut skips: Vec<PConvOutput> = Vec::with_capacity(self.depth());
        let mut encoder_traces = Vec::with_capacity(self.depth());
        let mut current = PConvOutput {
            image: image.clone(),
            mask: mask.clone(),
        };
        for stage in &self.encoder {
            let (out, trace) = stage.forward(&current.image, &current.mask, encoder_batch_stats);
            encoder_traces.push(trace);
            skips.push(current);
            current = out;
        }

        let mut decoder_traces = Vec::with_capacity(self.depth());
        for (stage, skip) in self.decoder.iter().zip(skips.iter().rev()) {
            let up_image = upsample_nearest2x(&current.image);
            let up_mask = upsample_nearest2x(&current.mask);
            let upsampled_channels = up_image.channels();
            let cat_image = Tensor4::concat_channels(&up_image, &skip.image);
            let cat_mask = Tensor4::concat_channels(&up_mask, &skip.mask);

            let (out, mut trace) = stage.forward(&cat_image, &cat_mask, self.training);
            trace.upsampled_channels = upsampled_channels;
            decoder_traces.push(trace);
            current = out;
        }

        let output_pre_activation = self.output.forward(&current.image);
        let prediction = output_pre_activation.map(sigmoid);

        NetworkTrace {
            encoder: encoder_traces,
            decoder: decoder_traces,
            output_input: current.image,
            output_pre_activation,
            prediction,
            mask: current.mask,
        }
    }

    /// Accumulate parameter gradients from dL/d(prediction).
    pub fn backward(&self, trace: &NetworkTrace, grad_prediction: &Tensor4) {
        grad_prediction.assert_same_dims(&trace.prediction, "PConvUNet backward");
        let depth = self.depth();

        let mut grad = grad_prediction.clone();
        Activation::Sigmoid.backward_inplace(trace.output_pre_activation.data(), grad.data_mut());
        grad = self.output.backward(&trace.output_input, &grad);

        // Skip gradients per encoder output
        let mut skip_grads: Vec<Option<Tensor4>> = vec![None; depth];
        for i in (0..depth).rev() {
            let stage_trace = &trace.decoder[i];
            let grad_cat = self.decoder[i].backward(stage_trace, &grad);
            let (grad_up, grad_skip) = grad_cat.split_channels(stage_trace.upsampled_channels);
            // Decoder i concatenates encoder output depth - 2 - i (or the network input)
            if let Some(encoder_index) = (depth - 1 - i).checked_sub(1) {
                skip_grads[encoder_index] = Some(grad_skip);
            }
            grad = upsample_nearest2x_backward(&grad_up);
        }

        for j in (0..depth).rev() {
            if let Some(skip) = skip_grads[j].take() {
                grad.add_assign(&skip);
            }
            grad = self.encoder[j].backward(&trace.encoder[j], &grad);
        }
    }

    /// One optimizer step over every trainable tensor, then clear gradients.
    ///
    /// Slots are assigned encoder first, then decoder, then the output projection.
    pub fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) {
        let mut slot = 0;
        for stage in self.encoder.iter_mut().chain(self.decoder.iter_mut()) {
            stage.update(optimizer, &mut slot);
        }
        self.output.update_with_optimizer(optimizer, &mut slot);
    }

    /// Forward, loss, backward and update for one batch.
    ///
    /// All gradients are computed before any parameter changes. Returns the
    /// loss terms and the prediction the loss was computed on.
    pub fn train_step(
        &mut self,
        extractor: &dyn FeatureExtractor,
        loss: &CompositeLoss,
        optimizer: &mut dyn Optimizer,
        image: &Tensor4,
        mask: &Tensor4,
        ground_truth: &Tensor4,
    ) -> (LossBreakdown, Tensor4) {
        let trace = self.forward_train(image, mask);
        let (breakdown, grad) =
            loss.evaluate_with_gradient(extractor, mask, ground_truth, &trace.prediction);
        self.backward(&trace, &grad);
        self.apply_gradients(optimizer);
        (breakdown, trace.prediction)
    }
}
