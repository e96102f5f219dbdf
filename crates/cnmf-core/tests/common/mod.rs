#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cnmf_core::error::{CnmfError, Result};
use cnmf_core::factorization::{
    CnmfOptions, Factorization, InitialComponents, MergeInput, MergedComponents, NoiseEstimate,
    PatchComponents, SpatialUpdate, TemporalUpdate,
};
use cnmf_core::pipeline::Patch;
use cnmf_core::{flat_index, ImagingDataset, PipelineConfig};
use image::{ImageBuffer, Luma};
use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis};

/// Value of pixel (row, col) in frame `t` of the synthetic recordings.
pub fn synthetic_value(row: usize, col: usize, t: usize) -> u16 {
    (100 + row * 7 + col * 3 + (t * 11) % 50) as u16
}

/// Write `frames` 16-bit PNG frames of `height × width` into `dir`.
pub fn write_png_frames(dir: &Path, height: usize, width: usize, frames: usize) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    (0..frames)
        .map(|t| {
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                    Luma([synthetic_value(y as usize, x as usize, t)])
                });
            let path = dir.join(format!("frame_{t:04}.png"));
            img.save(&path).unwrap();
            path
        })
        .collect()
}

/// Write a little-endian u16 raw recording and return its path.
pub fn write_raw_u16(path: &Path, height: usize, width: usize, frames: usize) -> PathBuf {
    let mut bytes = Vec::with_capacity(height * width * frames * 2);
    for t in 0..frames {
        for row in 0..height {
            for col in 0..width {
                bytes.extend_from_slice(&synthetic_value(row, col, t).to_le_bytes());
            }
        }
    }
    std::fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// A dataset of PNG frames whose caches live in `root/cache`.
pub fn png_dataset(root: &Path, name: &str, height: usize, width: usize, frames: usize) -> ImagingDataset {
    let paths = write_png_frames(&root.join("frames"), height, width, frames);
    ImagingDataset::new(name, root.join("cache"), paths)
}

/// Default config with a small fixed worker count.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        workers: Some(2),
        ..PipelineConfig::default()
    }
}

/// Gaussian blob footprint of a `height × width` frame, column-major.
pub fn gaussian_column(height: usize, width: usize, row: f64, col: f64, sigma: f64) -> Array1<f64> {
    let mut column = Array1::zeros(height * width);
    for c in 0..width {
        for r in 0..height {
            let d2 = (r as f64 - row).powi(2) + (c as f64 - col).powi(2);
            column[flat_index(r, c, height)] = (-d2 / (2.0 * sigma * sigma)).exp();
        }
    }
    column
}

/// Deterministic stand-in for the factorization library.
///
/// Produces correctly shaped outputs (Gaussian footprints, smooth traces),
/// records every call, and can be told to fail a named operation.
pub struct MockFactorization {
    calls: Mutex<Vec<&'static str>>,
    fail_on: Option<&'static str>,
}

impl MockFactorization {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    pub fn failing_on(operation: &'static str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(operation),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| **c == operation).count()
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(operation);
        if self.fail_on == Some(operation) {
            return Err(CnmfError::Factorization {
                operation,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl Factorization for MockFactorization {
    fn name(&self) -> &str {
        "mock"
    }

    fn preprocess(&self, yr: ArrayView2<'_, f32>, opts: &CnmfOptions) -> Result<NoiseEstimate> {
        self.record("preprocess")?;
        let sn = yr
            .axis_iter(Axis(0))
            .map(|row| {
                let n = row.len().max(1) as f64;
                let mean = row.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
                (row.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n).sqrt()
            })
            .collect();
        Ok(NoiseEstimate {
            sn,
            g: Array2::zeros((yr.nrows(), opts.preprocess.p)),
        })
    }

    fn initialize_components(
        &self,
        cube: ArrayView3<'_, f32>,
        opts: &CnmfOptions,
    ) -> Result<InitialComponents> {
        self.record("initialize_components")?;
        let (h, w, t) = cube.dim();
        let k = opts.init.k;
        let sigma = (h.min(w) as f64 / 8.0).max(1.0);
        let mut a = Array2::zeros((h * w, k));
        let mut centers = Array2::zeros((k, 2));
        for j in 0..k {
            let row = h as f64 * ((j % 3) as f64 + 1.0) / 4.0;
            let col = w as f64 * (((j / 3) % 3) as f64 + 1.0) / 4.0;
            a.column_mut(j).assign(&gaussian_column(h, w, row, col, sigma));
            centers[[j, 0]] = row;
            centers[[j, 1]] = col;
        }
        let c = Array2::from_shape_fn((k, t), |(j, s)| 1.0 + j as f64 + 0.01 * s as f64);
        Ok(InitialComponents {
            a,
            c,
            b: Array2::ones((h * w, 1)),
            f: Array2::ones((1, t)),
            centers,
        })
    }

    fn update_spatial(
        &self,
        yr: ArrayView2<'_, f32>,
        c: &Array2<f64>,
        f: &Array2<f64>,
        a: &Array2<f64>,
        _sn: &Array1<f64>,
        _opts: &CnmfOptions,
    ) -> Result<SpatialUpdate> {
        self.record("update_spatial")?;
        Ok(SpatialUpdate {
            a: a.clone(),
            b: Array2::ones((yr.nrows(), f.nrows())),
            c: c.clone(),
        })
    }

    fn update_temporal(
        &self,
        yr: ArrayView2<'_, f32>,
        a: &Array2<f64>,
        _b: &Array2<f64>,
        c: &Array2<f64>,
        f: &Array2<f64>,
        opts: &CnmfOptions,
    ) -> Result<TemporalUpdate> {
        self.record("update_temporal")?;
        let k = a.ncols();
        let t = yr.ncols();
        Ok(TemporalUpdate {
            c: c.clone(),
            f: f.clone(),
            s: c.mapv(|v| v * 0.5),
            bl: Array1::from_iter((0..k).map(|j| j as f64 * 0.1)),
            c1: Array1::zeros(k),
            neurons_sn: Array1::ones(k),
            g: Array2::zeros((k, opts.temporal.p)),
            yra: Array2::from_elem((k, t), 0.25),
        })
    }

    fn merge_components(
        &self,
        _yr: ArrayView2<'_, f32>,
        input: MergeInput<'_>,
        _opts: &CnmfOptions,
    ) -> Result<MergedComponents> {
        self.record("merge_components")?;
        Ok(MergedComponents {
            a: input.a.clone(),
            c: input.c.clone(),
            s: input.s.clone(),
            merged: Vec::new(),
            bl: input.bl.cloned(),
            c1: input.c1.cloned(),
            neurons_sn: input.neurons_sn.cloned(),
            g: input.g.cloned(),
        })
    }

    /// Reverses the component order.
    fn order_components(&self, a: &Array2<f64>, _c: &Array2<f64>) -> Result<Vec<usize>> {
        self.record("order_components")?;
        Ok((0..a.ncols()).rev().collect())
    }

    fn reduce_patches(
        &self,
        _yr: ArrayView2<'_, f32>,
        per_patch: &PatchComponents,
        _patches: &[Patch],
        _opts: &CnmfOptions,
    ) -> Result<PatchComponents> {
        self.record("reduce_patches")?;
        Ok(per_patch.clone())
    }
}
