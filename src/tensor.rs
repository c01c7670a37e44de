//! Rank-4 tensor used for images, masks and feature maps
//!
//! Data is stored flat in row-major order. The semantic axes are always
//! (batch, height, width, channel); the `DataLayout` tag decides how they map
//! onto memory:
//!
//! - `ChannelsLast`: `[batch, height, width, channels]`
//! - `ChannelsFirst`: `[batch, channels, height, width]`
//!
//! Batch is the outermost axis in both layouts, so each batch element occupies
//! one contiguous chunk of `height * width * channels` values. Kernels rely on
//! this to process batch elements in parallel.

use serde::{Deserialize, Serialize};

/// Memory layout of a `Tensor4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLayout {
    /// (batch, height, width, channel)
    #[default]
    ChannelsLast,
    /// (batch, channel, height, width)
    ChannelsFirst,
}

/// Offsets inside one batch element, detached from the tensor's storage so it
/// can be used while the data is split into per-sample chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleIndexer {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub layout: DataLayout,
}

impl SampleIndexer {
    #[inline]
    pub fn at(&self, y: usize, x: usize, c: usize) -> usize {
        match self.layout {
            DataLayout::ChannelsLast => (y * self.width + x) * self.channels + c,
            DataLayout::ChannelsFirst => (c * self.height + y) * self.width + x,
        }
    }

    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense rank-4 `f32` tensor with an explicit layout tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor4 {
    batch: usize,
    height: usize,
    width: usize,
    channels: usize,
    layout: DataLayout,
    data: Vec<f32>,
}

impl Tensor4 {
    /// Create a zero-filled tensor.
    pub fn zeros(
        batch: usize,
        height: usize,
        width: usize,
        channels: usize,
        layout: DataLayout,
    ) -> Self {
        Self::filled(batch, height, width, channels, layout, 0.0)
    }

    /// Create a tensor with every element set to `value`.
    pub fn filled(
        batch: usize,
        height: usize,
        width: usize,
        channels: usize,
        layout: DataLayout,
        value: f32,
    ) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
            layout,
            data: vec![value; batch * height * width * channels],
        }
    }

    /// Wrap existing data. `data` must already be ordered according to `layout`.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not match the product of the dimensions.
    pub fn from_vec(
        batch: usize,
        height: usize,
        width: usize,
        channels: usize,
        layout: DataLayout,
        data: Vec<f32>,
    ) -> Self {
        let expected = batch * height * width * channels;
        assert_eq!(
            data.len(),
            expected,
            "data len mismatch: expected {} ({}x{}x{}x{}), got {}",
            expected,
            batch,
            height,
            width,
            channels,
            data.len()
        );
        Self {
            batch,
            height,
            width,
            channels,
            layout,
            data,
        }
    }

    /// Build a tensor from a function of the semantic coordinates (b, y, x, c).
    pub fn from_fn<F>(
        batch: usize,
        height: usize,
        width: usize,
        channels: usize,
        layout: DataLayout,
        mut f: F,
    ) -> Self
    where
        F: FnMut(usize, usize, usize, usize) -> f32,
    {
        let mut tensor = Self::zeros(batch, height, width, channels, layout);
        for b in 0..batch {
            for y in 0..height {
                for x in 0..width {
                    for c in 0..channels {
                        let idx = tensor.index(b, y, x, c);
                        tensor.data[idx] = f(b, y, x, c);
                    }
                }
            }
        }
        tensor
    }

    /// A zero tensor with the same dimensions and layout as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(
            self.batch,
            self.height,
            self.width,
            self.channels,
            self.layout,
        )
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    /// Semantic dimensions `(batch, height, width, channels)` regardless of layout.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.height, self.width, self.channels)
    }

    /// Shape in memory order, e.g. `[B, C, H, W]` for channel-first data.
    pub fn shape(&self) -> [usize; 4] {
        match self.layout {
            DataLayout::ChannelsLast => [self.batch, self.height, self.width, self.channels],
            DataLayout::ChannelsFirst => [self.batch, self.channels, self.height, self.width],
        }
    }

    /// Number of values belonging to one batch element.
    pub fn sample_len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Flat offset of element (b, y, x, c).
    #[inline]
    pub fn index(&self, b: usize, y: usize, x: usize, c: usize) -> usize {
        b * self.sample_len() + self.sample_index(y, x, c)
    }

    /// Offset of (y, x, c) inside one batch element's chunk.
    #[inline]
    pub fn sample_index(&self, y: usize, x: usize, c: usize) -> usize {
        self.sample_indexer().at(y, x, c)
    }

    #[inline]
    pub fn get(&self, b: usize, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.index(b, y, x, c)]
    }

    #[inline]
    pub fn set(&mut self, b: usize, y: usize, x: usize, c: usize, value: f32) {
        let idx = self.index(b, y, x, c);
        self.data[idx] = value;
    }

    /// Copyable offset calculator for one batch element of this tensor.
    pub fn sample_indexer(&self) -> SampleIndexer {
        SampleIndexer {
            height: self.height,
            width: self.width,
            channels: self.channels,
            layout: self.layout,
        }
    }

    /// True when both tensors have the same semantic dimensions and layout.
    pub fn same_dims(&self, other: &Tensor4) -> bool {
        self.dims() == other.dims() && self.layout == other.layout
    }

    /// Panic unless `self` and `other` describe the same grid.
    pub fn assert_same_dims(&self, other: &Tensor4, context: &str) {
        assert!(
            self.same_dims(other),
            "{}: shape mismatch {:?} ({:?}) vs {:?} ({:?})",
            context,
            self.shape(),
            self.layout,
            other.shape(),
            other.layout
        );
    }

    /// Copy into another layout. Returns a clone when the layout already matches.
    pub fn to_layout(&self, layout: DataLayout) -> Tensor4 {
        if layout == self.layout {
            return self.clone();
        }
        let mut out = Tensor4::zeros(self.batch, self.height, self.width, self.channels, layout);
        for b in 0..self.batch {
            for y in 0..self.height {
                for x in 0..self.width {
                    for c in 0..self.channels {
                        let dst = out.index(b, y, x, c);
                        out.data[dst] = self.get(b, y, x, c);
                    }
                }
            }
        }
        out
    }

    /// Apply `f` to every element.
    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Tensor4 {
        let mut out = self.clone();
        for value in out.data.iter_mut() {
            *value = f(*value);
        }
        out
    }

    /// Combine two tensors of identical dimensions element by element.
    pub fn zip_map<F: Fn(f32, f32) -> f32>(&self, other: &Tensor4, f: F) -> Tensor4 {
        self.assert_same_dims(other, "zip_map");
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Tensor4 {
            data,
            ..self.shallow_header()
        }
    }

    /// Element-wise product.
    pub fn mul(&self, other: &Tensor4) -> Tensor4 {
        self.zip_map(other, |a, b| a * b)
    }

    /// In-place element-wise accumulation.
    pub fn add_assign(&mut self, other: &Tensor4) {
        self.assert_same_dims(other, "add_assign");
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    /// Concatenate along the channel axis: channels of `a` first, then `b`.
    pub fn concat_channels(a: &Tensor4, b: &Tensor4) -> Tensor4 {
        assert!(
            a.batch == b.batch && a.height == b.height && a.width == b.width,
            "concat_channels: spatial/batch mismatch {:?} vs {:?}",
            a.dims(),
            b.dims()
        );
        assert_eq!(a.layout, b.layout, "concat_channels: layout mismatch");
        let channels = a.channels + b.channels;
        let mut out = Tensor4::zeros(a.batch, a.height, a.width, channels, a.layout);
        for n in 0..a.batch {
            for y in 0..a.height {
                for x in 0..a.width {
                    for c in 0..a.channels {
                        out.set(n, y, x, c, a.get(n, y, x, c));
                    }
                    for c in 0..b.channels {
                        out.set(n, y, x, a.channels + c, b.get(n, y, x, c));
                    }
                }
            }
        }
        out
    }

    /// Split along the channel axis at `at`: `(channels[..at], channels[at..])`.
    pub fn split_channels(&self, at: usize) -> (Tensor4, Tensor4) {
        assert!(
            at <= self.channels,
            "split_channels: split point {} beyond {} channels",
            at,
            self.channels
        );
        let mut head = Tensor4::zeros(self.batch, self.height, self.width, at, self.layout);
        let mut tail = Tensor4::zeros(
            self.batch,
            self.height,
            self.width,
            self.channels - at,
            self.layout,
        );
        for n in 0..self.batch {
            for y in 0..self.height {
                for x in 0..self.width {
                    for c in 0..self.channels {
                        let value = self.get(n, y, x, c);
                        if c < at {
                            head.set(n, y, x, c, value);
                        } else {
                            tail.set(n, y, x, c - at, value);
                        }
                    }
                }
            }
        }
        (head, tail)
    }

    fn shallow_header(&self) -> Tensor4 {
        Tensor4 {
            batch: self.batch,
            height: self.height,
            width: self.width,
            channels: self.channels,
            layout: self.layout,
            data: Vec::new(),
        }
    }
}
