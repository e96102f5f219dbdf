use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, ArrayView3, Axis};

use crate::cache::{flat_index, pixel_position};
use crate::error::{CnmfError, Result};

/// One rectangular tile of the frame used by the patched pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub index: usize,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl Patch {
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.cols.len()
    }

    pub fn pixels(&self) -> usize {
        self.height() * self.width()
    }

    /// Full-frame linear index of a patch-local linear index.
    pub fn global_index(&self, local: usize, frame_height: usize) -> usize {
        let (row, col) = pixel_position(local, self.height());
        flat_index(self.rows.start + row, self.cols.start + col, frame_height)
    }

    /// Full-frame linear indices of every patch pixel, in local order.
    pub fn global_indices(&self, frame_height: usize) -> Vec<usize> {
        (0..self.pixels())
            .map(|local| self.global_index(local, frame_height))
            .collect()
    }

    /// View of the cube restricted to this patch.
    pub fn cube_view<'a>(&self, cube: ArrayView3<'a, f32>) -> ArrayView3<'a, f32> {
        cube.slice_move(s![self.rows.clone(), self.cols.clone(), ..])
    }

    /// Patch rows of the flattened movie, gathered into local pixel order.
    pub fn flat_rows(&self, yr: &ArrayView2<'_, f32>, frame_height: usize) -> Array2<f32> {
        yr.select(Axis(0), &self.global_indices(frame_height))
    }
}

/// Start offsets of windows of `size` along an axis of length `len`.
///
/// Windows step by `size - stride`; the last window sits flush with the
/// end so the axis is covered without a short trailing window.
pub fn window_starts(len: usize, size: usize, stride: usize) -> Vec<usize> {
    let size = size.min(len);
    if size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(stride).max(1);
    let mut starts = vec![0];
    let mut start = 0;
    while start + size < len {
        start += step;
        if start + size > len {
            starts.push(len - size);
            break;
        }
        starts.push(start);
    }
    starts
}

/// Overlapping square patches of side `2 * half_size + 1` covering a
/// `height × width` frame, row-major.
pub fn patch_grid(height: usize, width: usize, half_size: usize, stride: usize) -> Result<Vec<Patch>> {
    let side = 2 * half_size + 1;
    if half_size == 0 || stride >= side {
        return Err(CnmfError::InvalidParameter(format!(
            "patch half-size {half_size} with stride {stride} gives no forward step"
        )));
    }
    let row_starts = window_starts(height, side, stride);
    let col_starts = window_starts(width, side, stride);
    let (ph, pw) = (side.min(height), side.min(width));

    let mut patches = Vec::with_capacity(row_starts.len() * col_starts.len());
    for &r in &row_starts {
        for &c in &col_starts {
            patches.push(Patch {
                index: patches.len(),
                rows: r..r + ph,
                cols: c..c + pw,
            });
        }
    }
    Ok(patches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_starts_flush_with_end() {
        assert_eq!(window_starts(10, 5, 2), vec![0, 3, 5]);
        assert_eq!(window_starts(11, 5, 2), vec![0, 3, 6]);
        assert_eq!(window_starts(4, 5, 2), vec![0]);
    }

    #[test]
    fn test_global_index_maps_back_to_frame() {
        let patch = Patch {
            index: 0,
            rows: 2..5,
            cols: 1..3,
        };
        // local (row 1, col 1) -> frame (3, 2), frame height 6
        let local = flat_index(1, 1, 3);
        assert_eq!(patch.global_index(local, 6), flat_index(3, 2, 6));
    }

    #[test]
    fn test_flat_rows_gathers_patch_pixels() {
        let yr = Array2::from_shape_fn((12, 2), |(p, t)| (p * 10 + t) as f32);
        let patch = Patch {
            index: 0,
            rows: 1..3,
            cols: 2..4,
        };
        let rows = patch.flat_rows(&yr.view(), 3);
        assert_eq!(rows.dim(), (4, 2));
        // first local pixel is frame (1, 2) -> 1 + 2 * 3 = 7
        assert_eq!(rows[[0, 1]], 71.0);
    }

    #[test]
    fn test_invalid_stride_rejected() {
        assert!(patch_grid(64, 64, 2, 5).is_err());
        assert!(patch_grid(64, 64, 0, 0).is_err());
    }
}
