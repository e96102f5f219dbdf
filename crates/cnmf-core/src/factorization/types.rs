use ndarray::{Array1, Array2};

/// Per-pixel noise level and autoregressive coefficients estimated from
/// the power spectrum of each pixel's time series.
#[derive(Clone, Debug, PartialEq)]
pub struct NoiseEstimate {
    /// Noise standard deviation per pixel, length = pixels.
    pub sn: Array1<f64>,
    /// AR coefficients per pixel, pixels × p.
    pub g: Array2<f64>,
}

/// Output of component initialization.
#[derive(Clone, Debug, PartialEq)]
pub struct InitialComponents {
    /// Spatial footprints, pixels × K.
    pub a: Array2<f64>,
    /// Temporal traces, K × T.
    pub c: Array2<f64>,
    /// Background footprint(s), pixels × nb.
    pub b: Array2<f64>,
    /// Background trace(s), nb × T.
    pub f: Array2<f64>,
    /// Component centres as (row, col), K × 2.
    pub centers: Array2<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpatialUpdate {
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub c: Array2<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TemporalUpdate {
    /// Denoised traces, K × T.
    pub c: Array2<f64>,
    pub f: Array2<f64>,
    /// Deconvolved activity (spikes), K × T.
    pub s: Array2<f64>,
    /// Baseline per component.
    pub bl: Array1<f64>,
    /// Initial concentration per component.
    pub c1: Array1<f64>,
    /// Noise level per component.
    pub neurons_sn: Array1<f64>,
    /// AR coefficients per component, K × p.
    pub g: Array2<f64>,
    /// Residual traces, K × T.
    pub yra: Array2<f64>,
}

/// Borrowed inputs of a merge pass.
#[derive(Clone, Copy, Debug)]
pub struct MergeInput<'a> {
    pub a: &'a Array2<f64>,
    pub b: &'a Array2<f64>,
    pub c: &'a Array2<f64>,
    pub f: &'a Array2<f64>,
    pub s: &'a Array2<f64>,
    pub sn: &'a Array1<f64>,
    pub bl: Option<&'a Array1<f64>>,
    pub c1: Option<&'a Array1<f64>>,
    pub neurons_sn: Option<&'a Array1<f64>>,
    pub g: Option<&'a Array2<f64>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedComponents {
    pub a: Array2<f64>,
    pub c: Array2<f64>,
    pub s: Array2<f64>,
    /// Groups of input component indices that were merged together.
    pub merged: Vec<Vec<usize>>,
    pub bl: Option<Array1<f64>>,
    pub c1: Option<Array1<f64>>,
    pub neurons_sn: Option<Array1<f64>>,
    pub g: Option<Array2<f64>>,
}

impl MergedComponents {
    pub fn n_components(&self) -> usize {
        self.a.ncols()
    }
}

/// Spatial/temporal estimates in full-frame coordinates, as produced by the
/// patch map step and by patch reduction.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchComponents {
    pub a: Array2<f64>,
    pub c: Array2<f64>,
    pub b: Array2<f64>,
    pub f: Array2<f64>,
    /// Per-pixel noise, length = pixels.
    pub sn: Array1<f64>,
}

impl PatchComponents {
    pub fn n_components(&self) -> usize {
        self.a.ncols()
    }
}
