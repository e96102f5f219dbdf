use crate::cache::RecordingDims;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::patches::Patch;

/// Parameters for noise / AR-coefficient estimation.
#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessParams {
    pub n_processes: usize,
    pub n_pixels_per_process: usize,
    /// Autoregressive model order.
    pub p: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InitParams {
    /// Number of components to initialize.
    pub k: usize,
    /// Gaussian half-width of a neuron, (rows, cols).
    pub gsig: [usize; 2],
    pub ssub: usize,
    pub tsub: usize,
    pub n_iter: usize,
    pub max_iter: usize,
    pub use_hals: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpatialParams {
    pub n_processes: usize,
    pub n_pixels_per_process: usize,
    pub dims: RecordingDims,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TemporalParams {
    pub n_processes: usize,
    pub n_pixels_per_process: usize,
    pub p: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeParams {
    /// Correlation above which overlapping components are merged.
    pub thr: f64,
    /// Largest group merged at once; `None` means unbounded.
    pub max_merge: Option<usize>,
    pub fast_merge: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatchParams {
    /// Patch half-size in pixels.
    pub half_size: usize,
    /// Overlap between neighbouring patches, in pixels.
    pub stride: usize,
    pub memory_fact: f64,
}

/// Every parameter handed to the factorization library for one run.
///
/// Derived once from the [`PipelineConfig`], the recording dimensions and
/// the caller's request; never modified while stages execute.
#[derive(Clone, Debug, PartialEq)]
pub struct CnmfOptions {
    pub dims: RecordingDims,
    pub preprocess: PreprocessParams,
    pub init: InitParams,
    pub spatial: SpatialParams,
    pub temporal: TemporalParams,
    pub merging: MergeParams,
    pub patch: PatchParams,
}

impl CnmfOptions {
    /// Options for the whole-frame pass.
    pub fn single_pass(
        config: &PipelineConfig,
        dims: RecordingDims,
        workers: usize,
        p: usize,
        n_components: usize,
    ) -> Self {
        let sp = &config.single_pass;
        let merging = MergeParams {
            thr: sp.merge_threshold,
            max_merge: Some(sp.max_merge),
            fast_merge: sp.fast_merge,
        };
        Self::build(config, dims, workers, p, n_components, sp.ssub, sp.tsub, merging)
    }

    /// Options for the patched pass. `n_components` is the caller's total
    /// target; each patch initializes `n_components / workers / 2` (at
    /// least one).
    pub fn patched(
        config: &PipelineConfig,
        dims: RecordingDims,
        workers: usize,
        p: usize,
        n_components: usize,
    ) -> Self {
        let pc = &config.patches;
        let per_patch = components_per_patch(n_components, workers);
        let merging = MergeParams {
            thr: pc.merge_threshold,
            max_merge: None,
            fast_merge: false,
        };
        Self::build(config, dims, workers, p, per_patch, pc.ssub, pc.tsub, merging)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        config: &PipelineConfig,
        dims: RecordingDims,
        workers: usize,
        p: usize,
        k: usize,
        ssub: usize,
        tsub: usize,
        merging: MergeParams,
    ) -> Self {
        let workers = workers.max(1);
        let pixels_per_process = (dims.pixels() / workers).max(1);
        let comp = &config.components;
        Self {
            dims,
            preprocess: PreprocessParams {
                n_processes: workers,
                n_pixels_per_process: pixels_per_process,
                p,
            },
            init: InitParams {
                k,
                gsig: comp.gsig,
                ssub,
                tsub,
                n_iter: comp.n_iter,
                max_iter: comp.max_iter,
                use_hals: comp.use_hals,
            },
            spatial: SpatialParams {
                n_processes: workers,
                n_pixels_per_process: pixels_per_process,
                dims,
            },
            temporal: TemporalParams {
                n_processes: workers,
                n_pixels_per_process: pixels_per_process,
                p,
            },
            merging,
            patch: PatchParams {
                half_size: config.patches.half_size,
                stride: config.patches.stride,
                memory_fact: config.patches.memory_fact,
            },
        }
    }

    /// Options for solving one patch on a single worker.
    pub fn for_patch(&self, patch: &Patch) -> Self {
        let dims = RecordingDims {
            height: patch.height(),
            width: patch.width(),
            frames: self.dims.frames,
        };
        let pixels = dims.pixels().max(1);
        let mut opts = self.clone();
        opts.dims = dims;
        opts.preprocess.n_processes = 1;
        opts.preprocess.n_pixels_per_process = pixels;
        opts.spatial = SpatialParams {
            n_processes: 1,
            n_pixels_per_process: pixels,
            dims,
        };
        opts.temporal.n_processes = 1;
        opts.temporal.n_pixels_per_process = pixels;
        opts
    }

    /// Options for the global updates after patch reduction: the spatial and
    /// temporal passes use `pixels_per_process` and the component count is
    /// whatever survived reduction.
    pub fn for_global_refinement(&self, n_components: usize, pixels_per_process: usize) -> Self {
        let mut opts = self.clone();
        opts.init.k = n_components;
        opts.spatial.n_pixels_per_process = pixels_per_process;
        opts.temporal.n_pixels_per_process = pixels_per_process;
        opts
    }
}

/// Components each patch initializes in the patched pass.
///
/// The only place the worker count reaches the numeric result; everything
/// else it sets (process counts, pixel chunking) only splits work.
pub fn components_per_patch(n_components: usize, workers: usize) -> usize {
    (n_components / workers.max(1) / 2).max(1)
}

/// Pixels each worker handles during the global patched updates.
///
/// `pixels / workers`, shrunk proportionally once the recording is longer
/// than `memory_safety_frames`, to bound per-worker memory.
pub fn patched_pixel_budget(
    dims: RecordingDims,
    workers: usize,
    memory_safety_frames: f64,
) -> usize {
    let per_worker = dims.pixels() / workers.max(1);
    if dims.frames == 0 || memory_safety_frames <= 0.0 {
        return per_worker.max(1);
    }
    let scaled = per_worker as f64 / (dims.frames as f64 / memory_safety_frames);
    (scaled as usize).min(per_worker).max(1)
}
