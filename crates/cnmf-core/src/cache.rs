use std::path::Path;
use std::time::Instant;

use ndarray::{Array2, ArrayView2, ArrayView3};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::consts::CACHE_BATCH_FRAMES;
use crate::dataset::{kept_frames, ImagingDataset};
use crate::error::{CnmfError, Result};
use crate::io::frames::{open_frame_source, FrameSource};
use crate::io::npy::{MappedNpyWriter, NpyFile};

/// Linear index of pixel (row, col) in the flattened matrix.
///
/// Column-major over the spatial axes. Every conversion between a 2-D
/// frame and a pixel vector (cache building, contour reshaping, patch
/// lifting) goes through this function.
#[inline]
pub fn flat_index(row: usize, col: usize, height: usize) -> usize {
    row + col * height
}

/// Inverse of [`flat_index`].
#[inline]
pub fn pixel_position(index: usize, height: usize) -> (usize, usize) {
    (index % height, index / height)
}

/// Outcome of [`ensure_cache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Both caches were (re)written from the frame source.
    Converted { frames: usize },
    /// Both caches already existed; nothing was written.
    Reused,
}

/// Make sure the cube (`_Y.npy`) and flattened (`_Yr.npy`) caches exist.
///
/// Existing caches are trusted by presence alone: a file left behind by an
/// interrupted conversion is reused as if it were complete. Pass
/// `force = true` to rebuild.
pub fn ensure_cache(
    dataset: &ImagingDataset,
    mask: Option<&[bool]>,
    force: bool,
) -> Result<CacheStatus> {
    let cube_path = dataset.cube_path();
    let flat_path = dataset.flat_path();
    if !force && cube_path.exists() && flat_path.exists() {
        debug!(cube = %cube_path.display(), "Array caches present, skipping conversion");
        return Ok(CacheStatus::Reused);
    }

    info!(
        cube = %cube_path.display(),
        flat = %flat_path.display(),
        "Converting frames to array caches"
    );
    let t0 = Instant::now();
    let source = open_frame_source(dataset, mask)?;
    let kept = kept_frames(mask, source.frame_count());
    if kept.is_empty() {
        return Err(CnmfError::EmptySequence);
    }
    std::fs::create_dir_all(&dataset.cache_dir)?;
    write_caches(source.as_ref(), &kept, &cube_path, &flat_path)?;

    let (height, width) = source.dims();
    info!(
        frames = kept.len(),
        excluded = source.frame_count() - kept.len(),
        height,
        width,
        elapsed_s = t0.elapsed().as_secs_f64(),
        "Array caches written"
    );
    Ok(CacheStatus::Converted { frames: kept.len() })
}

/// Stream the kept frames into both layouts through mutable memory maps.
///
/// Frames are decoded a batch at a time; each batch is scattered into the
/// per-pixel time series of both files in parallel.
fn write_caches(
    source: &dyn FrameSource,
    kept: &[usize],
    cube_path: &Path,
    flat_path: &Path,
) -> Result<()> {
    let (h, w) = source.dims();
    let t = kept.len();
    if h == 0 || w == 0 {
        return Err(CnmfError::DimensionMismatch(format!(
            "frames have zero extent ({h}x{w})"
        )));
    }

    let mut cube = MappedNpyWriter::create(cube_path, &[h, w, t])?;
    let mut flat = MappedNpyWriter::create(flat_path, &[h * w, t])?;
    {
        let cube_data = cube.data_mut()?;
        let flat_data = flat.data_mut()?;

        for (batch_idx, batch) in kept.chunks(CACHE_BATCH_FRAMES).enumerate() {
            let first_t = batch_idx * CACHE_BATCH_FRAMES;
            let frames: Vec<Array2<f32>> = batch
                .par_iter()
                .map(|&i| source.read_frame(i))
                .collect::<Result<_>>()?;

            // Cube: C order over (row, col, time), one series per (row, col).
            cube_data
                .par_chunks_mut(t)
                .enumerate()
                .for_each(|(rc, series)| {
                    let (row, col) = (rc / w, rc % w);
                    for (k, frame) in frames.iter().enumerate() {
                        series[first_t + k] = frame[[row, col]];
                    }
                });

            // Flattened: one series per column-major pixel index.
            flat_data
                .par_chunks_mut(t)
                .enumerate()
                .for_each(|(p, series)| {
                    let (row, col) = pixel_position(p, h);
                    for (k, frame) in frames.iter().enumerate() {
                        series[first_t + k] = frame[[row, col]];
                    }
                });
            debug!(done = first_t + batch.len(), total = t, "Cached frame batch");
        }
    }
    cube.finalize()?;
    flat.finalize()?;
    Ok(())
}

/// Re-derive the flattened (pixels × time) matrix from a cube.
pub fn flatten_cube(cube: &ArrayView3<f32>) -> Array2<f32> {
    let (h, w, t) = cube.dim();
    let mut flat = Array2::<f32>::zeros((h * w, t));
    for col in 0..w {
        for row in 0..h {
            flat.row_mut(flat_index(row, col, h))
                .assign(&cube.slice(ndarray::s![row, col, ..]));
        }
    }
    flat
}

/// Memory-mapped views of both caches of a dataset.
pub struct CachedArrays {
    cube: NpyFile,
    flat: NpyFile,
    height: usize,
    width: usize,
    frames: usize,
}

impl CachedArrays {
    /// Open both caches and check that their shapes agree.
    pub fn open(dataset: &ImagingDataset) -> Result<Self> {
        let cube = NpyFile::open(&dataset.cube_path())?;
        let flat = NpyFile::open(&dataset.flat_path())?;

        let (height, width, frames) = match *cube.shape() {
            [h, w, t] => (h, w, t),
            _ => {
                return Err(CnmfError::DimensionMismatch(format!(
                    "cube {} has shape {:?}, expected (height, width, time)",
                    cube.path().display(),
                    cube.shape()
                )))
            }
        };
        if flat.shape() != [height * width, frames] {
            return Err(CnmfError::DimensionMismatch(format!(
                "flattened cache has shape {:?}, cube implies ({}, {})",
                flat.shape(),
                height * width,
                frames
            )));
        }

        let arrays = Self {
            cube,
            flat,
            height,
            width,
            frames,
        };
        // Surface dtype/layout problems at open time rather than mid-run.
        arrays.cube()?;
        arrays.flat()?;
        Ok(arrays)
    }

    /// (height, width, time)
    pub fn cube(&self) -> Result<ArrayView3<'_, f32>> {
        self.cube.view3()
    }

    /// (pixels, time)
    pub fn flat(&self) -> Result<ArrayView2<'_, f32>> {
        self.flat.view2()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn pixels(&self) -> usize {
        self.height * self.width
    }

    pub fn dims(&self) -> RecordingDims {
        RecordingDims {
            height: self.height,
            width: self.width,
            frames: self.frames,
        }
    }
}

/// Spatial and temporal extent of a cached recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordingDims {
    pub height: usize,
    pub width: usize,
    pub frames: usize,
}

impl RecordingDims {
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}
