//! Anchor priors and per-scale grid geometry.

use crate::{
    common::*,
    config::{ANCHORS_PER_SCALE, NUM_SCALES},
};
use bbox::HW;

/// The ordered anchor sizes in pixels, three per scale, finest scale first.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    /// The `[width, height]` pairs in pixels.
    pixels: Vec<[f64; 2]>,
}

impl AnchorSet {
    /// Build from `[width, height]` pixel pairs at the reference image size.
    pub fn new(pixels: &[[f64; 2]]) -> Result<Self> {
        ensure!(
            pixels.len() == NUM_SCALES * ANCHORS_PER_SCALE,
            "expect {} anchors, but get {}",
            NUM_SCALES * ANCHORS_PER_SCALE,
            pixels.len()
        );
        ensure!(
            pixels
                .iter()
                .flatten()
                .all(|&value| value.is_finite() && value > 0.0),
            "anchor sizes must be positive"
        );

        Ok(Self {
            pixels: pixels.to_vec(),
        })
    }

    /// Build from stride-divided pairs, scaling each group back by its stride.
    pub fn from_grid_units(pairs: &[[f64; 2]], strides: &[usize]) -> Result<Self> {
        ensure!(
            strides.len() == NUM_SCALES,
            "expect {} strides, but get {}",
            NUM_SCALES,
            strides.len()
        );
        ensure!(
            pairs.len() == NUM_SCALES * ANCHORS_PER_SCALE,
            "expect {} anchors, but get {}",
            NUM_SCALES * ANCHORS_PER_SCALE,
            pairs.len()
        );

        let pixels: Vec<_> = pairs
            .iter()
            .enumerate()
            .map(|(index, &[w, h])| {
                let stride = strides[index / ANCHORS_PER_SCALE] as f64;
                [w * stride, h * stride]
            })
            .collect();

        Self::new(&pixels)
    }

    pub fn pixels(&self) -> &[[f64; 2]] {
        &self.pixels
    }

    /// Anchor sizes relative to the image size, comparable with normalized boxes.
    pub fn normalized(&self, image_size: usize) -> Vec<HW<f64>> {
        let image_size = image_size as f64;
        self.pixels
            .iter()
            .map(|&[w, h]| HW::from_hw([h / image_size, w / image_size]))
            .collect()
    }

    /// The `[width, height]` anchors of a scale in grid cell units.
    pub fn scale_anchors(&self, scale: usize, stride: usize) -> [[f64; 2]; ANCHORS_PER_SCALE] {
        let stride = stride as f64;
        let offset = scale * ANCHORS_PER_SCALE;
        let mut anchors = [[0.0; 2]; ANCHORS_PER_SCALE];
        izip!(&mut anchors, &self.pixels[offset..(offset + ANCHORS_PER_SCALE)]).for_each(
            |(dst, &[w, h])| {
                *dst = [w / stride, h / stride];
            },
        );
        anchors
    }

    /// The `[3, 2]` tensor of grid unit anchors of a scale.
    pub fn to_tensor(&self, scale: usize, stride: usize, device: Device) -> Tensor {
        let values: Vec<f32> = self
            .scale_anchors(scale, stride)
            .iter()
            .flatten()
            .map(|&value| value as f32)
            .collect();
        Tensor::of_slice(&values)
            .view([ANCHORS_PER_SCALE as i64, 2])
            .to_device(device)
    }
}

/// The feature map resolution at one scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleDescriptor {
    pub stride: usize,
    pub grid_h: usize,
    pub grid_w: usize,
}

impl ScaleDescriptor {
    /// Read the grid size from a `[batch, 3, height, width, 5 + classes]` prediction.
    pub fn from_prediction(prediction: &Tensor, stride: usize) -> Result<Self> {
        let size = prediction.size();
        let (grid_h, grid_w) = match size.as_slice() {
            &[_batch, anchors, grid_h, grid_w, entries]
                if anchors == ANCHORS_PER_SCALE as i64 && entries > 5 =>
            {
                (grid_h as usize, grid_w as usize)
            }
            _ => bail!(
                "expect a [batch, {}, height, width, 5 + classes] prediction, but get shape {:?}",
                ANCHORS_PER_SCALE,
                size
            ),
        };
        ensure!(grid_h > 0 && grid_w > 0, "the grid must not be empty");

        Ok(Self {
            stride,
            grid_h,
            grid_w,
        })
    }

    /// Grid row and column of a normalized center.
    ///
    /// Centers mapping outside the grid are rejected.
    pub fn cell_of(&self, x: f64, y: f64) -> Result<(usize, usize)> {
        let row = (self.grid_h as f64 * y).floor();
        let col = (self.grid_w as f64 * x).floor();
        ensure!(
            row >= 0.0 && row < self.grid_h as f64 && col >= 0.0 && col < self.grid_w as f64,
            "the center ({}, {}) falls outside the {}x{} grid",
            x,
            y,
            self.grid_h,
            self.grid_w
        );
        Ok((row as usize, col as usize))
    }

    pub fn num_cells(&self) -> usize {
        ANCHORS_PER_SCALE * self.grid_h * self.grid_w
    }
}
