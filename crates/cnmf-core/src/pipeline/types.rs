use std::fmt;

use ndarray::{Array1, Array2};

use crate::cache::CachedArrays;
use crate::contour::RoiPolygon;

/// Pipeline processing stage, used for progress reporting and as the key
/// of stage snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Caching,
    Preprocessing,
    Initialization,
    SpatialUpdate,
    TemporalUpdate,
    PatchFactorization,
    PatchReduction,
    Merging,
    RefineSpatial,
    RefineTemporal,
    Ordering,
    Persisting,
    Projection,
    Contours,
}

impl PipelineStage {
    /// File-name key of the stage snapshot, for stages that have one.
    pub fn checkpoint_key(&self) -> Option<&'static str> {
        match self {
            Self::Preprocessing => Some("preprocess"),
            Self::Initialization => Some("init"),
            Self::SpatialUpdate => Some("spatial"),
            Self::TemporalUpdate => Some("temporal"),
            Self::PatchFactorization => Some("patches"),
            Self::PatchReduction => Some("reduce"),
            Self::Merging => Some("merge"),
            Self::RefineSpatial => Some("spatial_refined"),
            Self::RefineTemporal => Some("temporal_refined"),
            Self::Ordering => Some("order"),
            Self::Caching | Self::Persisting | Self::Projection | Self::Contours => None,
        }
    }

    /// Numeric stages of the whole-frame pass, in execution order.
    pub const SINGLE_PASS: [PipelineStage; 8] = [
        Self::Preprocessing,
        Self::Initialization,
        Self::SpatialUpdate,
        Self::TemporalUpdate,
        Self::Merging,
        Self::RefineSpatial,
        Self::RefineTemporal,
        Self::Ordering,
    ];

    /// Numeric stages of the patched pass, in execution order.
    pub const PATCHED: [PipelineStage; 6] = [
        Self::PatchFactorization,
        Self::PatchReduction,
        Self::Merging,
        Self::RefineSpatial,
        Self::RefineTemporal,
        Self::Ordering,
    ];
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caching => write!(f, "Caching frames"),
            Self::Preprocessing => write!(f, "Estimating noise"),
            Self::Initialization => write!(f, "Initializing components"),
            Self::SpatialUpdate => write!(f, "Updating footprints"),
            Self::TemporalUpdate => write!(f, "Updating traces"),
            Self::PatchFactorization => write!(f, "Factorizing patches"),
            Self::PatchReduction => write!(f, "Combining patches"),
            Self::Merging => write!(f, "Merging components"),
            Self::RefineSpatial => write!(f, "Refining footprints"),
            Self::RefineTemporal => write!(f, "Refining traces"),
            Self::Ordering => write!(f, "Ordering components"),
            Self::Persisting => write!(f, "Writing results"),
            Self::Projection => write!(f, "Computing projection"),
            Self::Contours => write!(f, "Tracing contours"),
        }
    }
}

/// Which orchestrator produced (or should produce) a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunMode {
    SinglePass,
    Patched,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinglePass => write!(f, "single"),
            Self::Patched => write!(f, "patched"),
        }
    }
}

/// Thread-safe progress reporting for the pipeline.
///
/// Implementors can use this to drive progress bars, logging, or any other
/// UI feedback. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// A new pipeline stage has started. `total_items` is the number of
    /// work items in this stage (e.g. patch count), if known.
    fn begin_stage(&self, _stage: PipelineStage, _total_items: Option<usize>) {}

    /// One work item within the current stage has completed.
    fn advance(&self, _items_done: usize) {}

    /// The current stage is finished.
    fn finish_stage(&self) {}
}

pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}

/// Everything an extraction run hands back.
pub struct ExtractionOutput {
    /// One outline per component, in component order.
    pub rois: Vec<RoiPolygon>,
    /// Spatial footprints `A`, pixels × K.
    pub footprints: Array2<f64>,
    /// Denoised traces `C`, K × T.
    pub traces: Array2<f64>,
    /// Deconvolved activity `S`, K × T.
    pub spikes: Array2<f64>,
    /// Residual traces `YrA`, K × T.
    pub residual: Array2<f64>,
    /// Baseline per component.
    pub baseline: Array1<f64>,
    /// Temporal projection of the recording, height × width.
    pub projection: Array2<f32>,
    /// Memory-mapped array caches the run worked on.
    pub recording: CachedArrays,
    /// True when the numeric stages were skipped in favour of a stored bundle.
    pub reused_bundle: bool,
}

impl ExtractionOutput {
    pub fn n_components(&self) -> usize {
        self.footprints.ncols()
    }
}

impl fmt::Debug for ExtractionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionOutput")
            .field("components", &self.n_components())
            .field("dims", &self.recording.dims())
            .field("reused_bundle", &self.reused_bundle)
            .finish_non_exhaustive()
    }
}
