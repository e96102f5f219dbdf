//! Boundary to the numerical CNMF library.
//!
//! The pipeline never does the factorization maths itself. It drives an
//! implementation of [`Factorization`] stage by stage and persists what each
//! stage returns. A process without a usable library gets
//! [`MissingFactorization`], which fails every call with
//! [`CnmfError::FactorizationUnavailable`] but still allows previously
//! computed results to be replayed.

pub mod missing;
pub mod options;
pub mod types;

use ndarray::{Array1, Array2, ArrayView2, ArrayView3};

use crate::error::{CnmfError, Result};
use crate::pipeline::patches::Patch;

pub use missing::MissingFactorization;
pub use options::{
    components_per_patch, patched_pixel_budget, CnmfOptions, InitParams, MergeParams, PatchParams,
    PreprocessParams, SpatialParams, TemporalParams,
};
pub use types::{
    InitialComponents, MergeInput, MergedComponents, NoiseEstimate, PatchComponents,
    SpatialUpdate, TemporalUpdate,
};

/// The set of numerical operations the extraction pipeline needs.
///
/// Inputs are the flattened movie `yr` (pixels × time, column-major pixel
/// order) and, where the operation needs the 2-D layout, the cube
/// (height × width × time). Implementations must be callable from several
/// worker threads at once; the patched pass solves patches concurrently.
pub trait Factorization: Send + Sync {
    /// Short backend name for logs and errors.
    fn name(&self) -> &str;

    /// Whether the library can actually be called in this process.
    fn is_available(&self) -> bool {
        true
    }

    /// Estimate per-pixel noise and AR coefficients.
    fn preprocess(&self, yr: ArrayView2<'_, f32>, opts: &CnmfOptions) -> Result<NoiseEstimate>;

    /// Greedy initialization of `opts.init.k` components.
    fn initialize_components(
        &self,
        cube: ArrayView3<'_, f32>,
        opts: &CnmfOptions,
    ) -> Result<InitialComponents>;

    fn update_spatial(
        &self,
        yr: ArrayView2<'_, f32>,
        c: &Array2<f64>,
        f: &Array2<f64>,
        a: &Array2<f64>,
        sn: &Array1<f64>,
        opts: &CnmfOptions,
    ) -> Result<SpatialUpdate>;

    fn update_temporal(
        &self,
        yr: ArrayView2<'_, f32>,
        a: &Array2<f64>,
        b: &Array2<f64>,
        c: &Array2<f64>,
        f: &Array2<f64>,
        opts: &CnmfOptions,
    ) -> Result<TemporalUpdate>;

    fn merge_components(
        &self,
        yr: ArrayView2<'_, f32>,
        input: MergeInput<'_>,
        opts: &CnmfOptions,
    ) -> Result<MergedComponents>;

    /// Permutation sorting components by significance. Element `i` is the
    /// index of the component that moves to position `i`.
    fn order_components(&self, a: &Array2<f64>, c: &Array2<f64>) -> Result<Vec<usize>>;

    /// Combine per-patch estimates (already lifted to full-frame pixel
    /// indices) into one global estimate.
    fn reduce_patches(
        &self,
        yr: ArrayView2<'_, f32>,
        per_patch: &PatchComponents,
        patches: &[Patch],
        opts: &CnmfOptions,
    ) -> Result<PatchComponents>;
}

/// Check that `order` is a permutation of `0..n`.
pub fn validate_permutation(order: &[usize], n: usize) -> Result<()> {
    let mut seen = vec![false; n];
    if order.len() != n {
        return Err(CnmfError::Factorization {
            operation: "order_components",
            message: format!("permutation has {} entries for {n} components", order.len()),
        });
    }
    for &i in order {
        match seen.get_mut(i) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                return Err(CnmfError::Factorization {
                    operation: "order_components",
                    message: format!("invalid or repeated index {i} in permutation"),
                })
            }
        }
    }
    Ok(())
}
