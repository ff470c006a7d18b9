//! Spectrogram → fixed `(H, W, 3)` classifier input.
//!
//! ```text
//! [n_mels, frames] ──► fit width (pad with min / center crop)
//!                  ──► bilinear resize when n_mels ≠ H
//!                  ──► pixel normalization, stacked to 3 channels
//! ```

use ndarray::{s, Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::config::TargetShape;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How dB values are mapped into the range a classifier was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelNormalization {
    /// dB values passed through; for graphs that rescale internally.
    Raw,
    /// `[0, 1]` over the clip's `top_db` dynamic range.
    Unit,
    /// `[0, 255]` over the dynamic range, then `v / 127.5 − 1`.
    Tf,
    /// `[0, 1]`, then per-channel ImageNet mean/std.
    Torch,
}

impl PixelNormalization {
    /// Closed interval every output value falls in; `None` for `Raw`.
    pub fn nominal_range(&self) -> Option<(f32, f32)> {
        match self {
            Self::Raw => None,
            Self::Unit => Some((0.0, 1.0)),
            Self::Tf => Some((-1.0, 1.0)),
            Self::Torch => {
                let lo = (0..3)
                    .map(|c| -IMAGENET_MEAN[c] / IMAGENET_STD[c])
                    .fold(f32::INFINITY, f32::min);
                let hi = (0..3)
                    .map(|c| (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
                    .fold(f32::NEG_INFINITY, f32::max);
                Some((lo, hi))
            }
        }
    }

    fn apply(&self, unit: f32, db: f32, channel: usize) -> f32 {
        match self {
            Self::Raw => db,
            Self::Unit => unit,
            Self::Tf => (unit * 255.0) / 127.5 - 1.0,
            Self::Torch => (unit - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }
}

/// Classifier input, `(height, width, 3)` in NHWC order without the batch axis.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedTensor {
    data: Array3<f32>,
}

impl FixedTensor {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            data: Array3::zeros((height, width, 3)),
        }
    }

    /// `[height, width, channels]`
    pub fn shape(&self) -> [usize; 3] {
        let (h, w, c) = self.data.dim();
        [h, w, c]
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn as_slice(&self) -> Option<&[f32]> {
        self.data.as_slice()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShapeReconciler {
    target: TargetShape,
    normalization: PixelNormalization,
    top_db: f32,
}

impl ShapeReconciler {
    pub fn new(target: TargetShape, normalization: PixelNormalization, top_db: f32) -> Self {
        Self {
            target,
            normalization,
            top_db,
        }
    }

    pub fn target(&self) -> TargetShape {
        self.target
    }

    pub fn normalization(&self) -> PixelNormalization {
        self.normalization
    }

    /// Produce a tensor of exactly `(target.height, target.width, 3)`.
    ///
    /// An empty grid yields a constant tensor rather than an error.
    pub fn reconcile(&self, spectrogram: &Array2<f32>) -> FixedTensor {
        let grid = if spectrogram.is_empty() {
            Array2::zeros((self.target.height, self.target.width))
        } else {
            let fitted = fit_width(spectrogram, self.target.width);
            if fitted.nrows() == self.target.height {
                fitted
            } else {
                resize_bilinear(&fitted, self.target.height, self.target.width)
            }
        };
        self.normalize(&grid)
    }

    fn normalize(&self, grid: &Array2<f32>) -> FixedTensor {
        let peak = grid.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let peak = if peak.is_finite() { peak } else { 0.0 };
        let lowest = grid
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f32::INFINITY, f32::min);
        // A flat grid (silence, empty input) carries no energy contrast and maps to the floor.
        let flat = !lowest.is_finite() || peak - lowest <= f32::EPSILON;
        let floor = peak - self.top_db;
        let range = if self.top_db > 0.0 { self.top_db } else { 1.0 };

        let (h, w) = grid.dim();
        let mut data = Array3::<f32>::zeros((h, w, 3));
        for ((row, col), &db) in grid.indexed_iter() {
            let db = if db.is_finite() { db } else { floor };
            let unit = if flat {
                0.0
            } else {
                ((db - floor) / range).clamp(0.0, 1.0)
            };
            for c in 0..3 {
                data[[row, col, c]] = self.normalization.apply(unit, db, c);
            }
        }
        FixedTensor { data }
    }
}

/// Right-pad with the grid's minimum or center-crop so the grid has `width` columns.
pub fn fit_width(grid: &Array2<f32>, width: usize) -> Array2<f32> {
    let (rows, cols) = grid.dim();
    if cols == width {
        return grid.clone();
    }
    if cols > width {
        let start = (cols - width) / 2;
        return grid.slice(s![.., start..start + width]).to_owned();
    }
    let fill = grid.iter().copied().fold(f32::INFINITY, f32::min);
    let fill = if fill.is_finite() { fill } else { 0.0 };
    let mut out = Array2::from_elem((rows, width), fill);
    out.slice_mut(s![.., ..cols]).assign(grid);
    out
}

/// Bilinear resize with half-pixel centers and edge clamping.
pub fn resize_bilinear(grid: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = grid.dim();
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }
    let rows: Vec<(usize, usize, f32)> = (0..out_h).map(|y| source_coord(y, in_h, out_h)).collect();
    let cols: Vec<(usize, usize, f32)> = (0..out_w).map(|x| source_coord(x, in_w, out_w)).collect();

    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for (y, &(y0, y1, fy)) in rows.iter().enumerate() {
        for (x, &(x0, x1, fx)) in cols.iter().enumerate() {
            let top = grid[[y0, x0]] * (1.0 - fx) + grid[[y0, x1]] * fx;
            let bottom = grid[[y1, x0]] * (1.0 - fx) + grid[[y1, x1]] * fx;
            out[[y, x]] = top * (1.0 - fy) + bottom * fy;
        }
    }
    out
}

fn source_coord(dst: usize, in_len: usize, out_len: usize) -> (usize, usize, f32) {
    let scale = in_len as f32 / out_len as f32;
    let src = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (in_len - 1) as f32);
    let lo = src.floor() as usize;
    let hi = (lo + 1).min(in_len - 1);
    (lo, hi, src - lo as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, ArrayView2, Axis};

    fn channel(tensor: &FixedTensor, c: usize) -> ArrayView2<'_, f32> {
        tensor.data.index_axis(Axis(2), c)
    }

    fn reconciler(h: usize, w: usize, norm: PixelNormalization) -> ShapeReconciler {
        ShapeReconciler::new(TargetShape { height: h, width: w }, norm, 80.0)
    }

    #[test]
    fn narrow_grid_is_padded_with_its_minimum() {
        let grid = array![[-10.0, -20.0], [-30.0, -5.0]];
        let out = fit_width(&grid, 4);
        assert_eq!(out, array![[-10.0, -20.0, -30.0, -30.0], [-30.0, -5.0, -30.0, -30.0]]);
    }

    #[test]
    fn wide_grid_is_center_cropped() {
        let grid = Array2::from_shape_fn((2, 9), |(_, c)| c as f32);
        let out = fit_width(&grid, 4);
        // start = (9 − 4) / 2 = 2
        assert_eq!(out.row(0).to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(fit_width(&grid, 9), grid);
    }

    #[test]
    fn bilinear_uses_half_pixel_centers() {
        let grid = array![[0.0, 1.0]];
        let out = resize_bilinear(&grid, 1, 4);
        let expected = [0.0, 0.25, 0.75, 1.0];
        for (got, want) in out.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn bilinear_same_size_is_identity() {
        let grid = Array2::from_shape_fn((5, 7), |(r, c)| (r * 7 + c) as f32 * 0.3);
        assert_eq!(resize_bilinear(&grid, 5, 7), grid);
    }

    #[test]
    fn height_mismatch_is_resized_and_values_stay_in_range() {
        let grid = Array2::from_shape_fn((128, 300), |(r, c)| -(((r + c) % 80) as f32));
        let tensor = reconciler(240, 240, PixelNormalization::Raw).reconcile(&grid);
        assert_eq!(tensor.shape(), [240, 240, 3]);
        let (lo, hi) = (-79.0, 0.0);
        assert!(tensor.view().iter().all(|&v| (lo..=hi).contains(&v)));
        // Resizing interpolates, so the values differ from a plain copy.
        assert!(tensor.view().iter().any(|v| v.fract() != 0.0));
    }

    #[test]
    fn every_mode_respects_its_nominal_range() {
        let grid = Array2::from_shape_fn((240, 50), |(r, c)| -(((r * 3 + c * 7) % 81) as f32));
        for mode in [
            PixelNormalization::Unit,
            PixelNormalization::Tf,
            PixelNormalization::Torch,
        ] {
            let tensor = reconciler(240, 240, mode).reconcile(&grid);
            let (lo, hi) = mode.nominal_range().unwrap();
            assert!(
                tensor.view().iter().all(|&v| v >= lo - 1e-5 && v <= hi + 1e-5),
                "{mode:?} out of range"
            );
            assert!(tensor.is_finite());
        }
        assert_eq!(PixelNormalization::Raw.nominal_range(), None);
    }

    #[test]
    fn tf_mode_maps_peak_and_floor_to_unit_interval_edges() {
        let grid = array![[0.0, -80.0], [-40.0, -120.0]];
        let tensor = reconciler(2, 2, PixelNormalization::Tf).reconcile(&grid);
        assert_relative_eq!(tensor.view()[[0, 0, 0]], 1.0, epsilon = 1e-6);
        assert_relative_eq!(tensor.view()[[0, 1, 0]], -1.0, epsilon = 1e-6);
        assert_relative_eq!(tensor.view()[[1, 0, 0]], 0.0, epsilon = 1e-6);
        assert_relative_eq!(tensor.view()[[1, 1, 0]], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn channels_are_replicated_except_for_torch() {
        let grid = Array2::from_shape_fn((4, 4), |(r, c)| -((r * 4 + c) as f32) * 5.0);
        let tensor = reconciler(4, 4, PixelNormalization::Unit).reconcile(&grid);
        assert_eq!(channel(&tensor, 0), channel(&tensor, 1));
        assert_eq!(channel(&tensor, 1), channel(&tensor, 2));

        let torch = reconciler(4, 4, PixelNormalization::Torch).reconcile(&grid);
        assert_ne!(channel(&torch, 0), channel(&torch, 2));
    }

    #[test]
    fn empty_grid_gives_constant_finite_tensor() {
        let tensor = reconciler(8, 6, PixelNormalization::Tf).reconcile(&Array2::zeros((0, 0)));
        assert_eq!(tensor.shape(), [8, 6, 3]);
        assert!(tensor.is_finite());
        let first = tensor.view()[[0, 0, 0]];
        assert!(tensor.view().iter().all(|&v| v == first));
    }

    #[test]
    fn flat_grid_sits_at_the_bottom_of_the_range() {
        let grid = Array2::from_elem((16, 10), -100.0);
        let tf = reconciler(16, 12, PixelNormalization::Tf).reconcile(&grid);
        assert!(tf.view().iter().all(|&v| (v + 1.0).abs() < 1e-6));

        let unit = reconciler(16, 12, PixelNormalization::Unit).reconcile(&grid);
        assert!(unit.view().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn shape_is_exact_for_any_width() {
        let r = reconciler(128, 240, PixelNormalization::Tf);
        for frames in [1usize, 17, 239, 240, 241, 1_000] {
            let grid = Array2::from_elem((128, frames), -12.0);
            assert_eq!(r.reconcile(&grid).shape(), [128, 240, 3]);
        }
    }
}
