mod common;

use approx::assert_abs_diff_eq;
use cnmf_core::contour::{contours, inclusion_depth, RoiPolygon};
use cnmf_core::error::CnmfError;
use cnmf_core::flat_index;
use ndarray::Array2;

use common::gaussian_column;

fn blob_matrix(height: usize, width: usize, centers: &[(f64, f64)], sigma: f64) -> Array2<f64> {
    let mut a = Array2::zeros((height * width, centers.len()));
    for (j, &(row, col)) in centers.iter().enumerate() {
        a.column_mut(j)
            .assign(&gaussian_column(height, width, row, col, sigma));
    }
    a
}

fn enclosed_pixels(poly: &RoiPolygon, height: usize, width: usize) -> Vec<(usize, usize)> {
    let mut inside = Vec::new();
    for row in 0..height {
        for col in 0..width {
            if poly.contains(col as f64, row as f64) {
                inside.push((row, col));
            }
        }
    }
    inside
}

#[test]
fn test_one_polygon_per_component() {
    let a = blob_matrix(20, 24, &[(5.0, 5.0), (12.0, 18.0), (15.0, 6.0)], 2.0);
    let rois = contours(a.view(), 20, 24, 0.9).unwrap();
    assert_eq!(rois.len(), 3);
    for (i, roi) in rois.iter().enumerate() {
        assert_eq!(roi.component, i);
        assert!(roi.len() >= 3);
        assert!(!roi.is_degenerate());
        assert_eq!(roi.points.first(), roi.points.last());
    }
}

#[test]
fn test_many_components_keep_input_order() {
    let centers: Vec<(f64, f64)> = (0..12).map(|i| (4.0 + i as f64, 3.0 + 2.0 * i as f64)).collect();
    let a = blob_matrix(20, 30, &centers, 1.5);
    let rois = contours(a.view(), 20, 30, 0.8).unwrap();
    assert_eq!(rois.len(), 12);
    for (i, roi) in rois.iter().enumerate() {
        assert_eq!(roi.component, i);
        let (row, col) = centers[i];
        assert!(roi.contains(col, row), "component {i} does not enclose its centre");
    }
}

#[test]
fn test_points_are_column_row() {
    // Blob near the top-right of a wide frame.
    let a = blob_matrix(10, 30, &[(2.0, 25.0)], 1.5);
    let roi = &contours(a.view(), 10, 30, 0.9).unwrap()[0];
    assert!(roi.contains(25.0, 2.0));
    for p in &roi.points {
        assert!(p[0] > 20.0 && p[0] < 30.0, "x {} outside the blob columns", p[0]);
        assert!(p[1] > -1.0 && p[1] < 6.0, "y {} outside the blob rows", p[1]);
    }
}

#[test]
fn test_threshold_monotonicity() {
    let (h, w) = (25, 25);
    let a = blob_matrix(h, w, &[(12.0, 11.0)], 3.0);
    let thresholds = [0.3, 0.5, 0.7, 0.9, 0.99];
    let regions: Vec<Vec<(usize, usize)>> = thresholds
        .iter()
        .map(|&thr| {
            let roi = &contours(a.view(), h, w, thr).unwrap()[0];
            enclosed_pixels(roi, h, w)
        })
        .collect();

    for pair in regions.windows(2) {
        assert!(pair[0].len() <= pair[1].len());
        for px in &pair[0] {
            assert!(pair[1].contains(px), "pixel {px:?} lost at a higher threshold");
        }
    }
    assert!(regions[0].len() < regions[4].len());
}

#[test]
fn test_region_matches_energy_fraction() {
    // The enclosed pixels are exactly those whose inclusion depth is below
    // the threshold.
    let (h, w) = (15, 15);
    let a = blob_matrix(h, w, &[(7.0, 7.0)], 2.0);
    let depth = inclusion_depth(a.column(0)).unwrap();
    let roi = &contours(a.view(), h, w, 0.6).unwrap()[0];
    for row in 0..h {
        for col in 0..w {
            let below = depth[flat_index(row, col, h)] < 0.6;
            assert_eq!(roi.contains(col as f64, row as f64), below, "pixel ({row}, {col})");
        }
    }
}

#[test]
fn test_degenerate_component_gives_placeholder() {
    let mut a = blob_matrix(8, 8, &[(3.0, 3.0), (4.0, 4.0)], 1.0);
    a.column_mut(1).fill(0.0);
    let rois = contours(a.view(), 8, 8, 0.9).unwrap();
    assert_eq!(rois.len(), 2);
    assert!(!rois[0].is_degenerate());
    assert!(rois[1].is_degenerate());
    assert_eq!(rois[1].points, vec![[0.0, 0.0]; 3]);
}

#[test]
fn test_blob_touching_frame_edge_is_closed() {
    let a = blob_matrix(10, 10, &[(0.0, 0.0)], 2.0);
    let roi = &contours(a.view(), 10, 10, 0.9).unwrap()[0];
    assert!(!roi.is_degenerate());
    assert_eq!(roi.points.first(), roi.points.last());
    assert!(roi.contains(0.0, 0.0));
}

#[test]
fn test_dominant_pixel_footprint() {
    // Energies 25 and 1 of 26: only the heavy pixel lies below 0.97.
    let mut a = Array2::zeros((16, 1));
    a[[flat_index(2, 1, 4), 0]] = 5.0;
    a[[flat_index(0, 3, 4), 0]] = 1.0;
    let roi = &contours(a.view(), 4, 4, 0.97).unwrap()[0];
    assert!(roi.contains(1.0, 2.0));
    assert!(!roi.contains(2.0, 2.0));
    assert!(!roi.contains(3.0, 0.0));
    // Diamond whose vertices sit 0.22 px from the pixel centre.
    assert_abs_diff_eq!(roi.area(), 2.0 * 0.22 * 0.22, epsilon = 1e-9);
}

#[test]
fn test_lone_pixel_has_no_outline() {
    // A single non-zero pixel already carries all of the energy.
    let mut a = Array2::zeros((16, 1));
    a[[flat_index(2, 1, 4), 0]] = 5.0;
    assert!(contours(a.view(), 4, 4, 0.9).unwrap()[0].is_degenerate());
}

#[test]
fn test_invalid_threshold_rejected() {
    let a = blob_matrix(5, 5, &[(2.0, 2.0)], 1.0);
    for thr in [0.0, -0.5, 1.5, f64::NAN] {
        assert!(matches!(
            contours(a.view(), 5, 5, thr),
            Err(CnmfError::InvalidParameter(_))
        ));
    }
    assert!(contours(a.view(), 5, 5, 1.0).is_ok());
}

#[test]
fn test_row_count_must_match_frame() {
    let a = blob_matrix(5, 5, &[(2.0, 2.0)], 1.0);
    assert!(matches!(
        contours(a.view(), 4, 5, 0.9),
        Err(CnmfError::DimensionMismatch(_))
    ));
}

#[test]
fn test_empty_component_set() {
    let a = Array2::<f64>::zeros((9, 0));
    assert!(contours(a.view(), 3, 3, 0.9).unwrap().is_empty());
}
