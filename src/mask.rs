//! Random irregular hole masks
//!
//! Holes are drawn as thick strokes: straight lines, circle outlines and
//! elliptic arcs (rectangle outlines optionally), each family with a random
//! count between 1 and 15. Stroke widths scale with the image size through
//! `scale_ratio`. The result is inverted, so 1 marks a known pixel and 0 a hole,
//! and the same pattern is repeated over every channel.

use crate::tensor::{DataLayout, Tensor4};
use crate::utils::SimpleRng;
use std::f32::consts::PI;

pub const DEFAULT_SCALE_RATIO: f32 = 0.03;

const MAX_SHAPES: usize = 15;
const MIN_STROKE: usize = 4;
const MIN_ELLIPSE_STROKE: usize = 20;
const MAX_RECTANGLE_STROKE: usize = 20;
const CIRCLE_RADIUS: (usize, usize) = (30, 50);
const ARC_ANGLE: (usize, usize) = (3, 180);

/// Which stroke families are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskShapes {
    pub lines: bool,
    pub circles: bool,
    pub ellipses: bool,
    pub rectangles: bool,
}

impl Default for MaskShapes {
    fn default() -> Self {
        Self {
            lines: true,
            circles: true,
            ellipses: true,
            rectangles: false,
        }
    }
}

/// Hole mask generator for one image geometry.
///
/// # Example
///
/// ```
/// use pconv_inpainting::mask::MaskGenerator;
/// use pconv_inpainting::tensor::DataLayout;
/// use pconv_inpainting::utils::SimpleRng;
///
/// let generator = MaskGenerator::new(64, 64, 3);
/// let mut rng = SimpleRng::new(42);
/// let mask = generator.generate(&mut rng, DataLayout::ChannelsLast);
/// assert_eq!(mask.dims(), (1, 64, 64, 3));
/// assert!(mask.data().iter().all(|&v| v == 0.0 || v == 1.0));
/// ```
#[derive(Debug, Clone)]
pub struct MaskGenerator {
    height: usize,
    width: usize,
    channels: usize,
    scale_ratio: f32,
    shapes: MaskShapes,
}

/// Single-channel drawing surface; 1 marks a hole.
struct Canvas {
    height: usize,
    width: usize,
    pixels: Vec<u8>,
}

impl Canvas {
    fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            pixels: vec![0; height * width],
        }
    }

    fn stamp_disk(&mut self, cx: f32, cy: f32, radius: f32) {
        let r2 = radius * radius;
        let y0 = (cy - radius).floor().max(0.0) as usize;
        let x0 = (cx - radius).floor().max(0.0) as usize;
        let y1 = ((cy + radius).ceil() as isize).min(self.height as isize - 1);
        let x1 = ((cx + radius).ceil() as isize).min(self.width as isize - 1);
        if y1 < 0 || x1 < 0 {
            return;
        }
        for y in y0..=y1 as usize {
            let dy = y as f32 - cy;
            for x in x0..=x1 as usize {
                let dx = x as f32 - cx;
                if dx * dx + dy * dy <= r2 {
                    self.pixels[y * self.width + x] = 1;
                }
            }
        }
    }

    /// Thick segment: disks of diameter `thickness` stamped along it.
    fn segment(&mut self, from: (f32, f32), to: (f32, f32), thickness: usize) {
        let radius = (thickness as f32 / 2.0).max(0.5);
        let step = (radius * 0.5).max(0.5);
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let length = (dx * dx + dy * dy).sqrt();
        let n = (length / step).ceil().max(1.0) as usize;
        for i in 0..=n {
            let t = i as f32 / n as f32;
            self.stamp_disk(from.0 + t * dx, from.1 + t * dy, radius);
        }
    }

    fn polyline(&mut self, points: &[(f32, f32)], thickness: usize) {
        for pair in points.windows(2) {
            self.segment(pair[0], pair[1], thickness);
        }
    }

    /// Arc of a rotated ellipse from `start` to `end` degrees (swapped if reversed).
    fn ellipse_arc(
        &mut self,
        center: (f32, f32),
        axes: (f32, f32),
        angle: f32,
        start: f32,
        end: f32,
        thickness: usize,
    ) {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let (sin_a, cos_a) = angle.to_radians().sin_cos();
        let span = (end - start).to_radians();
        let perimeter = span * axes.0.max(axes.1);
        let n = (perimeter / 2.0).ceil().max(2.0) as usize;
        let points: Vec<(f32, f32)> = (0..=n)
            .map(|i| {
                let t = start.to_radians() + span * i as f32 / n as f32;
                let (ex, ey) = (axes.0 * t.cos(), axes.1 * t.sin());
                (
                    center.0 + ex * cos_a - ey * sin_a,
                    center.1 + ex * sin_a + ey * cos_a,
                )
            })
            .collect();
        self.polyline(&points, thickness);
    }
}

impl MaskGenerator {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            scale_ratio: DEFAULT_SCALE_RATIO,
            shapes: MaskShapes::default(),
        }
    }

    pub fn with_scale_ratio(mut self, scale_ratio: f32) -> Self {
        self.scale_ratio = scale_ratio;
        self
    }

    pub fn with_shapes(mut self, shapes: MaskShapes) -> Self {
        self.shapes = shapes;
        self
    }

    /// Largest stroke width: (height + width) · scale_ratio.
    pub fn stroke_scale(&self) -> usize {
        ((self.height + self.width) as f32 * self.scale_ratio) as usize
    }

    fn random_point(&self, rng: &mut SimpleRng) -> (f32, f32) {
        (
            rng.gen_range_inclusive(1, self.width) as f32,
            rng.gen_range_inclusive(1, self.height) as f32,
        )
    }

    fn draw(&self, rng: &mut SimpleRng) -> Canvas {
        let mut canvas = Canvas::new(self.height, self.width);
        let scale = self.stroke_scale();

        if self.shapes.lines {
            for _ in 0..rng.gen_range_inclusive(1, MAX_SHAPES) {
                let from = self.random_point(rng);
                let to = self.random_point(rng);
                let thickness = rng.gen_range_inclusive(MIN_STROKE, scale);
                canvas.segment(from, to, thickness);
            }
        }

        if self.shapes.circles {
            for _ in 0..rng.gen_range_inclusive(1, MAX_SHAPES) {
                let center = self.random_point(rng);
                let radius = rng.gen_range_inclusive(CIRCLE_RADIUS.0, CIRCLE_RADIUS.1) as f32;
                let thickness = rng.gen_range_inclusive(MIN_STROKE, scale);
                canvas.ellipse_arc(center, (radius, radius), 0.0, 0.0, 360.0, thickness);
            }
        }

        if self.shapes.ellipses {
            for _ in 0..rng.gen_range_inclusive(1, MAX_SHAPES) {
                let center = self.random_point(rng);
                let axes = self.random_point(rng);
                let angle = rng.gen_range_inclusive(ARC_ANGLE.0, ARC_ANGLE.1) as f32;
                let start = rng.gen_range_inclusive(ARC_ANGLE.0, ARC_ANGLE.1) as f32;
                let end = rng.gen_range_inclusive(ARC_ANGLE.0, ARC_ANGLE.1) as f32;
                let thickness = rng.gen_range_inclusive(MIN_ELLIPSE_STROKE, scale);
                canvas.ellipse_arc(center, axes, angle, start, end, thickness);
            }
        }

        if self.shapes.rectangles {
            for _ in 0..rng.gen_range_inclusive(1, MAX_SHAPES) {
                let (x1, y1) = self.random_point(rng);
                let (x2, y2) = self.random_point(rng);
                let thickness = rng.gen_range_inclusive(MIN_STROKE, MAX_RECTANGLE_STROKE);
                canvas.polyline(&[(x1, y1), (x2, y1), (x2, y2), (x1, y2), (x1, y1)], thickness);
            }
        }

        canvas
    }

    /// One mask of shape (1, height, width, channels).
    pub fn generate(&self, rng: &mut SimpleRng, layout: DataLayout) -> Tensor4 {
        self.generate_batch(1, rng, layout)
    }

    /// `batch` independent masks.
    pub fn generate_batch(&self, batch: usize, rng: &mut SimpleRng, layout: DataLayout) -> Tensor4 {
        let canvases: Vec<Canvas> = (0..batch).map(|_| self.draw(rng)).collect();
        Tensor4::from_fn(batch, self.height, self.width, self.channels, layout, |b, y, x, _| {
            let canvas = &canvases[b];
            1.0 - canvas.pixels[y * canvas.width + x] as f32
        })
    }
}
