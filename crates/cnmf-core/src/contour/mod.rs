//! ROI outlines from spatial footprints.
//!
//! Each footprint column is turned into an inclusion-depth map: pixels are
//! ranked by weight and each gets the fraction of the column's squared
//! energy carried by itself and every heavier pixel. The iso-line of that
//! map at the threshold encloses the smallest set of pixels holding that
//! fraction of the energy.

pub mod marching;

use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use tracing::debug;

use crate::cache::flat_index;
use crate::consts::{DEGENERATE_POLYGON, PARALLEL_COMPONENT_THRESHOLD};
use crate::error::{CnmfError, Result};

use self::marching::first_closed_contour;

/// Outline of one component, as ordered `[x, y]` = `[column, row]` points
/// in pixel coordinates. Closed rings repeat their first point.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiPolygon {
    pub component: usize,
    pub points: Vec<[f64; 2]>,
}

impl RoiPolygon {
    pub fn degenerate(component: usize) -> Self {
        Self {
            component,
            points: DEGENERATE_POLYGON.to_vec(),
        }
    }

    /// True for the all-origin placeholder of a component without an outline.
    pub fn is_degenerate(&self) -> bool {
        self.points.iter().all(|p| p[0] == 0.0 && p[1] == 0.0)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Enclosed area (shoelace formula).
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let twice: f64 = (0..n)
            .map(|i| {
                let [x0, y0] = self.points[i];
                let [x1, y1] = self.points[(i + 1) % n];
                x0 * y1 - x1 * y0
            })
            .sum();
        twice.abs() / 2.0
    }
}

/// Outline every column of `a` (pixels × components) at energy fraction
/// `thr`. Output order and length follow the columns of `a`.
pub fn contours(a: ArrayView2<'_, f64>, height: usize, width: usize, thr: f64) -> Result<Vec<RoiPolygon>> {
    if !(thr > 0.0 && thr <= 1.0) {
        return Err(CnmfError::InvalidParameter(format!(
            "contour threshold must be in (0, 1], got {thr}"
        )));
    }
    if a.nrows() != height * width {
        return Err(CnmfError::DimensionMismatch(format!(
            "footprints have {} rows, frame is {height}x{width} = {} pixels",
            a.nrows(),
            height * width
        )));
    }

    let k = a.ncols();
    let trace = |i: usize| component_contour(a.column(i), i, height, width, thr);
    let rois: Vec<RoiPolygon> = if k >= PARALLEL_COMPONENT_THRESHOLD {
        (0..k).into_par_iter().map(trace).collect()
    } else {
        (0..k).map(trace).collect()
    };

    let degenerate = rois.iter().filter(|r| r.is_degenerate()).count();
    debug!(components = k, degenerate, thr, "Traced component contours");
    Ok(rois)
}

fn component_contour(
    column: ArrayView1<'_, f64>,
    component: usize,
    height: usize,
    width: usize,
    thr: f64,
) -> RoiPolygon {
    let Some(depth) = inclusion_depth(column) else {
        return RoiPolygon::degenerate(component);
    };

    // One-cell border of depth 1.0 closes contours touching the frame edge.
    let mut grid = Array2::<f64>::from_elem((height + 2, width + 2), 1.0);
    for col in 0..width {
        for row in 0..height {
            grid[[row + 1, col + 1]] = depth[flat_index(row, col, height)];
        }
    }

    match first_closed_contour(&grid, thr) {
        Some(ring) if ring.len() >= 3 => RoiPolygon {
            component,
            points: ring.into_iter().map(|[x, y]| [x - 1.0, y - 1.0]).collect(),
        },
        _ => RoiPolygon::degenerate(component),
    }
}

/// Cumulative squared-energy fraction per pixel, in pixel order.
///
/// Pixels are visited by descending weight (ties keep pixel order); the
/// heaviest pixel gets the smallest value and the last one gets 1.0.
/// Returns `None` when the column has no finite positive energy.
pub fn inclusion_depth(column: ArrayView1<'_, f64>) -> Option<Vec<f64>> {
    let mut order: Vec<usize> = (0..column.len()).collect();
    order.sort_by(|&i, &j| column[j].total_cmp(&column[i]));

    let mut cumulative = Vec::with_capacity(order.len());
    let mut running = 0.0;
    for &i in &order {
        running += column[i] * column[i];
        cumulative.push(running);
    }
    let total = *cumulative.last()?;
    if !(total.is_finite() && total > 0.0) {
        return None;
    }

    let mut depth = vec![0.0; column.len()];
    for (&i, &c) in order.iter().zip(&cumulative) {
        depth[i] = c / total;
    }
    Some(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn test_inclusion_depth_orders_by_weight() {
        let col = Array1::from(vec![1.0, 3.0, 0.0, 2.0]);
        let depth = inclusion_depth(col.view()).unwrap();
        // energies: 9, 4, 1, 0 of 14
        assert!((depth[1] - 9.0 / 14.0).abs() < 1e-12);
        assert!((depth[3] - 13.0 / 14.0).abs() < 1e-12);
        assert!((depth[0] - 1.0).abs() < 1e-12);
        assert!((depth[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_inclusion_depth_zero_column() {
        let col = Array1::<f64>::zeros(5);
        assert!(inclusion_depth(col.view()).is_none());
    }

    #[test]
    fn test_inclusion_depth_nan_column() {
        let col = Array1::from(vec![1.0, f64::NAN]);
        assert!(inclusion_depth(col.view()).is_none());
    }

    #[test]
    fn test_polygon_contains_and_area() {
        let square = RoiPolygon {
            component: 0,
            points: vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]],
        };
        assert!(square.contains(1.0, 1.0));
        assert!(!square.contains(3.0, 1.0));
        assert!((square.area() - 4.0).abs() < 1e-12);
        assert!(RoiPolygon::degenerate(3).is_degenerate());
        assert_eq!(RoiPolygon::degenerate(3).len(), 3);
    }
}
