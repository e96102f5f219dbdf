use ndarray::{Array2, ArrayView1, ArrayView3, Axis, Ix2, Zip};
use tracing::{debug, info};

use crate::consts::PARALLEL_PIXEL_THRESHOLD;
use crate::dataset::ImagingDataset;
use crate::error::Result;
use crate::io::npy::{read_npy_f32, write_npy_f32};

use super::config::ProjectionKind;

fn reduce(series: ArrayView1<'_, f32>, kind: ProjectionKind) -> f32 {
    let n = series.len();
    if n == 0 {
        return 0.0;
    }
    match kind {
        ProjectionKind::Max => series.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        ProjectionKind::Mean => {
            (series.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64) as f32
        }
        ProjectionKind::Std => {
            let mean = series.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
            let var = series
                .iter()
                .map(|&v| (f64::from(v) - mean).powi(2))
                .sum::<f64>()
                / n as f64;
            var.sqrt() as f32
        }
    }
}

/// Collapse the time axis of a (height, width, time) cube.
pub fn project(cube: &ArrayView3<'_, f32>, kind: ProjectionKind) -> Array2<f32> {
    let (h, w, _) = cube.dim();
    let mut out = Array2::<f32>::zeros((h, w));
    let zip = Zip::from(&mut out).and(cube.lanes(Axis(2)));
    if h * w >= PARALLEL_PIXEL_THRESHOLD {
        zip.par_for_each(|o, series| *o = reduce(series, kind));
    } else {
        zip.for_each(|o, series| *o = reduce(series, kind));
    }
    out
}

/// Load `<base>_proj.npy` if present, otherwise compute and store it.
///
/// Reuse is by presence only; the projection depends on nothing but the
/// cube.
pub fn load_or_compute(
    dataset: &ImagingDataset,
    cube: &ArrayView3<'_, f32>,
    kind: ProjectionKind,
) -> Result<Array2<f32>> {
    let path = dataset.projection_path();
    if path.exists() {
        let image = read_npy_f32::<Ix2>(&path)?;
        if image.dim() == (cube.dim().0, cube.dim().1) {
            debug!(path = %path.display(), "Loaded cached projection");
            return Ok(image);
        }
        debug!(path = %path.display(), "Cached projection has stale shape, recomputing");
    }
    let image = project(cube, kind);
    write_npy_f32(&path, &image.view())?;
    info!(path = %path.display(), kind = %kind, "Projection written");
    Ok(image)
}
