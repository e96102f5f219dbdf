use ndarray::{Array1, Array2, ArrayView2, ArrayView3};

use super::{
    CnmfOptions, Factorization, InitialComponents, MergeInput, MergedComponents, NoiseEstimate,
    PatchComponents, SpatialUpdate, TemporalUpdate,
};
use crate::error::{CnmfError, Result};
use crate::pipeline::patches::Patch;

/// Stand-in used when no factorization library is linked into the process.
///
/// Every numeric call fails with [`CnmfError::FactorizationUnavailable`].
/// Cached bundles can still be replayed since replay makes no library calls.
#[derive(Clone, Debug)]
pub struct MissingFactorization {
    backend: String,
}

impl MissingFactorization {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    fn unavailable<T>(&self, operation: &'static str) -> Result<T> {
        Err(CnmfError::FactorizationUnavailable {
            backend: self.backend.clone(),
            operation,
        })
    }
}

impl Default for MissingFactorization {
    fn default() -> Self {
        Self::new("cnmf")
    }
}

impl Factorization for MissingFactorization {
    fn name(&self) -> &str {
        &self.backend
    }

    fn is_available(&self) -> bool {
        false
    }

    fn preprocess(&self, _yr: ArrayView2<'_, f32>, _opts: &CnmfOptions) -> Result<NoiseEstimate> {
        self.unavailable("preprocess")
    }

    fn initialize_components(
        &self,
        _cube: ArrayView3<'_, f32>,
        _opts: &CnmfOptions,
    ) -> Result<InitialComponents> {
        self.unavailable("initialize_components")
    }

    fn update_spatial(
        &self,
        _yr: ArrayView2<'_, f32>,
        _c: &Array2<f64>,
        _f: &Array2<f64>,
        _a: &Array2<f64>,
        _sn: &Array1<f64>,
        _opts: &CnmfOptions,
    ) -> Result<SpatialUpdate> {
        self.unavailable("update_spatial")
    }

    fn update_temporal(
        &self,
        _yr: ArrayView2<'_, f32>,
        _a: &Array2<f64>,
        _b: &Array2<f64>,
        _c: &Array2<f64>,
        _f: &Array2<f64>,
        _opts: &CnmfOptions,
    ) -> Result<TemporalUpdate> {
        self.unavailable("update_temporal")
    }

    fn merge_components(
        &self,
        _yr: ArrayView2<'_, f32>,
        _input: MergeInput<'_>,
        _opts: &CnmfOptions,
    ) -> Result<MergedComponents> {
        self.unavailable("merge_components")
    }

    fn order_components(&self, _a: &Array2<f64>, _c: &Array2<f64>) -> Result<Vec<usize>> {
        self.unavailable("order_components")
    }

    fn reduce_patches(
        &self,
        _yr: ArrayView2<'_, f32>,
        _per_patch: &PatchComponents,
        _patches: &[Patch],
        _opts: &CnmfOptions,
    ) -> Result<PatchComponents> {
        self.unavailable("reduce_patches")
    }
}
