//! Frozen VGG16 feature extractor for the perceptual and style losses
//!
//! Only the first three VGG16 blocks are needed:
//!
//! ```text
//! block1: conv3x3(c1) -> relu -> conv3x3(c1) -> relu -> maxpool2x2   => pool1
//! block2: conv3x3(c2) -> relu -> conv3x3(c2) -> relu -> maxpool2x2   => pool2
//! block3: 3 x (conv3x3(c3) -> relu)                  -> maxpool2x2   => pool3
//! ```
//!
//! with (c1, c2, c3) = (64, 128, 256) for the real network. Inputs in [0, 1]
//! are normalised with the ImageNet mean and standard deviation before the
//! first convolution.
//!
//! The extractor never changes after construction. Its backward pass returns
//! the gradient with respect to the input images only; there is no API that
//! touches its weights.

use crate::layers::{Conv2DLayer, Layer};
use crate::layers::sampling::{max_pool2x2, max_pool2x2_backward, PoolOutput};
use crate::tensor::{DataLayout, Tensor4};
use crate::utils::{Initializer, SimpleRng};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Output channels of VGG16 blocks 1 to 3.
pub const VGG16_BLOCK_CHANNELS: [usize; 3] = [64, 128, 256];

/// Smallest image side that leaves a non-empty pool3 map.
pub const MIN_IMAGE_SIZE: usize = 8;

/// Convolutions per block.
const CONVS_PER_BLOCK: [usize; 3] = [2, 2, 3];

/// Maps a batch of RGB images to three feature maps of decreasing resolution.
pub trait FeatureExtractor {
    /// Feature maps (channel-last) at three depths.
    fn extract(&self, images: &Tensor4) -> [Tensor4; 3];

    /// Gradient with respect to `images`, given gradients for each of the
    /// three feature maps. The result has the layout of `images`.
    fn backward(&self, images: &Tensor4, grads: &[Tensor4; 3]) -> Tensor4;
}

/// One convolution's parameters in a weights file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvWeights {
    pub name: String,
    /// HWIO order, 3x3 kernels.
    pub kernel: Vec<f32>,
    pub bias: Vec<f32>,
}

/// On-disk format of the extractor's weights.
///
/// ```json
/// {
///   "block_channels": [64, 128, 256],
///   "layers": [
///     { "name": "block1_conv1", "kernel": [...], "bias": [...] },
///     ...
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VggWeights {
    pub block_channels: [usize; 3],
    pub layers: Vec<ConvWeights>,
}

/// Intermediate values kept by one forward pass.
struct ExtractTrace {
    /// (conv input, pre-activation) for every convolution, in order.
    convs: Vec<(Tensor4, Tensor4)>,
    /// Pool result (with argmax) per block.
    pools: Vec<PoolOutput>,
}

/// VGG16 blocks 1-3 with fixed weights.
pub struct VggFeatureExtractor {
    block_channels: [usize; 3],
    convs: Vec<Conv2DLayer>,
}

fn invalid_data(message: String) -> Box<dyn Error> {
    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

fn layer_names() -> Vec<String> {
    CONVS_PER_BLOCK
        .iter()
        .enumerate()
        .flat_map(|(block, &n)| (1..=n).map(move |i| format!("block{}_conv{}", block + 1, i)))
        .collect()
}

/// (in_channels, out_channels) of every convolution, in order.
fn conv_shapes(block_channels: [usize; 3]) -> Vec<(usize, usize)> {
    let mut shapes = Vec::new();
    let mut in_channels = 3;
    for (block, &n) in CONVS_PER_BLOCK.iter().enumerate() {
        for _ in 0..n {
            shapes.push((in_channels, block_channels[block]));
            in_channels = block_channels[block];
        }
    }
    shapes
}

impl VggFeatureExtractor {
    /// Build from an in-memory weights description.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if layers are missing, misnamed or mis-sized.
    pub fn from_weights(weights: VggWeights) -> Result<Self, Box<dyn Error>> {
        let names = layer_names();
        let shapes = conv_shapes(weights.block_channels);
        if weights.block_channels.iter().any(|&c| c == 0) {
            return Err(invalid_data("block_channels must be positive".to_string()));
        }
        if weights.layers.len() != names.len() {
            return Err(invalid_data(format!(
                "expected {} convolution layers, found {}",
                names.len(),
                weights.layers.len()
            )));
        }

        let mut convs = Vec::with_capacity(names.len());
        for ((layer, name), (in_c, out_c)) in weights.layers.into_iter().zip(&names).zip(shapes) {
            if &layer.name != name {
                return Err(invalid_data(format!(
                    "expected layer '{}', found '{}'",
                    name, layer.name
                )));
            }
            if layer.kernel.len() != 9 * in_c * out_c {
                return Err(invalid_data(format!(
                    "{}: kernel has {} values, expected 3x3x{}x{} = {}",
                    name,
                    layer.kernel.len(),
                    in_c,
                    out_c,
                    9 * in_c * out_c
                )));
            }
            if layer.bias.len() != out_c {
                return Err(invalid_data(format!(
                    "{}: bias has {} values, expected {}",
                    name,
                    layer.bias.len(),
                    out_c
                )));
            }
            convs.push(Conv2DLayer::from_parameters(
                in_c,
                out_c,
                3,
                1,
                layer.kernel,
                layer.bias,
            ));
        }

        debug!(
            "VGG feature extractor: block channels {:?}, {} convolutions",
            weights.block_channels,
            convs.len()
        );
        Ok(Self {
            block_channels: weights.block_channels,
            convs,
        })
    }

    /// Load pretrained weights from a JSON file.
    pub fn from_weights_file(path: &str) -> Result<Self, Box<dyn Error>> {
        let contents = fs::read_to_string(path)?;
        let weights: VggWeights = serde_json::from_str(&contents)?;
        let extractor = Self::from_weights(weights)?;
        info!("Loaded feature extractor weights from {}", path);
        Ok(extractor)
    }

    /// He-normal weights from `seed`. Useful for tests and smoke runs; the
    /// perceptual and style terms are only meaningful with pretrained weights.
    pub fn random(block_channels: [usize; 3], seed: u64) -> Self {
        warn!(
            "Feature extractor uses random weights (seed {}); perceptual and style losses are not pretrained",
            seed
        );
        let mut rng = SimpleRng::new(seed);
        let convs = conv_shapes(block_channels)
            .into_iter()
            .map(|(in_c, out_c)| {
                let kernel =
                    Initializer::HeNormal.initialize(9 * in_c * out_c, 9 * in_c, 9 * out_c, &mut rng);
                Conv2DLayer::from_parameters(in_c, out_c, 3, 1, kernel, vec![0.0; out_c])
            })
            .collect();
        Self {
            block_channels,
            convs,
        }
    }

    /// Weights file if a path is given, seeded random weights otherwise.
    pub fn load_or_random(
        path: Option<&str>,
        block_channels: [usize; 3],
        seed: u64,
    ) -> Result<Self, Box<dyn Error>> {
        match path {
            Some(path) => {
                let extractor = Self::from_weights_file(path)?;
                if extractor.block_channels != block_channels {
                    warn!(
                        "Weights file {} has block channels {:?}, configured {:?}",
                        path, extractor.block_channels, block_channels
                    );
                }
                Ok(extractor)
            }
            None => Ok(Self::random(block_channels, seed)),
        }
    }

    /// Current weights in file form.
    pub fn to_weights(&self) -> VggWeights {
        VggWeights {
            block_channels: self.block_channels,
            layers: layer_names()
                .into_iter()
                .zip(&self.convs)
                .map(|(name, conv)| ConvWeights {
                    name,
                    kernel: conv.weights().to_vec(),
                    bias: conv.biases().to_vec(),
                })
                .collect(),
        }
    }

    pub fn save_weights(&self, path: &str) -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string(&self.to_weights())?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn block_channels(&self) -> [usize; 3] {
        self.block_channels
    }

    /// Channel-last, ImageNet-normalised copy of `images`.
    fn normalize(images: &Tensor4) -> Tensor4 {
        assert_eq!(
            images.channels(),
            3,
            "feature extractor expects 3-channel images, got {}",
            images.channels()
        );
        let (batch, h, w, _) = images.dims();
        Tensor4::from_fn(batch, h, w, 3, DataLayout::ChannelsLast, |b, y, x, c| {
            (images.get(b, y, x, c) - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
        })
    }

    fn forward_trace(&self, images: &Tensor4) -> ([Tensor4; 3], ExtractTrace) {
        let mut x = Self::normalize(images);
        let mut trace = ExtractTrace {
            convs: Vec::with_capacity(self.convs.len()),
            pools: Vec::with_capacity(3),
        };
        let mut convs = self.convs.iter();

        for &n in CONVS_PER_BLOCK.iter() {
            for conv in convs.by_ref().take(n) {
                let z = conv.forward(&x);
                let a = z.map(|v| v.max(0.0));
                trace.convs.push((x, z));
                x = a;
            }
            let pool = max_pool2x2(&x);
            x = pool.output.clone();
            trace.pools.push(pool);
        }

        let outputs = [
            trace.pools[0].output.clone(),
            trace.pools[1].output.clone(),
            x,
        ];
        (outputs, trace)
    }
}

impl FeatureExtractor for VggFeatureExtractor {
    fn extract(&self, images: &Tensor4) -> [Tensor4; 3] {
        self.forward_trace(images).0
    }

    fn backward(&self, images: &Tensor4, grads: &[Tensor4; 3]) -> Tensor4 {
        let (outputs, trace) = self.forward_trace(images);
        for (g, out) in grads.iter().zip(outputs.iter()) {
            g.assert_same_dims(out, "feature extractor backward");
        }

        let mut conv_index = self.convs.len();
        let mut g = grads[2].clone();

        for block in (0..3).rev() {
            // The last pre-activation has the pooled activation's dims
            let pool_input = &trace.convs[conv_index - 1].1;
            g = max_pool2x2_backward(&trace.pools[block], pool_input, &g);

            for _ in 0..CONVS_PER_BLOCK[block] {
                conv_index -= 1;
                let (input, z) = &trace.convs[conv_index];
                let g_z = g.zip_map(z, |gv, zv| if zv > 0.0 { gv } else { 0.0 });
                g = self.convs[conv_index].backward_input(input, &g_z);
            }

            if block > 0 {
                g.add_assign(&grads[block - 1]);
            }
        }

        let (batch, h, w, _) = images.dims();
        Tensor4::from_fn(batch, h, w, 3, images.layout(), |b, y, x, c| {
            g.get(b, y, x, c) / IMAGENET_STD[c]
        })
    }
}
