use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::cache::{ensure_cache, CacheStatus, CachedArrays};
use crate::contour::contours;
use crate::dataset::ImagingDataset;
use crate::error::{CnmfError, Result};
use crate::factorization::Factorization;
use crate::fingerprint::{run_fingerprint, Fingerprint};
use crate::pool::WorkerPool;

use super::bundle::{BundleStore, ResultBundle};
use super::checkpoint::{Checkpoint, CheckpointStore};
use super::config::PipelineConfig;
use super::projection;
use super::types::{ExtractionOutput, NoOpReporter, PipelineStage, ProgressReporter, RunMode};

/// Drives an extraction run: caching, factorization through the configured
/// library, result persistence and contour tracing.
pub struct Extractor {
    config: PipelineConfig,
    library: Arc<dyn Factorization>,
    reporter: Arc<dyn ProgressReporter>,
}

impl Extractor {
    pub fn new(config: PipelineConfig, library: Arc<dyn Factorization>) -> Self {
        if !library.is_available() {
            warn!(
                backend = library.name(),
                "Factorization library unavailable; only stored results can be replayed"
            );
        }
        Self {
            config,
            library,
            reporter: Arc::new(NoOpReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whole-frame extraction of `n_components` components with an AR
    /// model of order `p`. `mask` marks frames to exclude.
    pub fn extract(
        &self,
        dataset: &ImagingDataset,
        mask: Option<&[bool]>,
        p: usize,
        n_components: usize,
    ) -> Result<ExtractionOutput> {
        self.run(RunMode::SinglePass, dataset, mask, p, n_components)
    }

    /// Patch-decomposed extraction; same contract as [`Extractor::extract`].
    pub fn extract_patched(
        &self,
        dataset: &ImagingDataset,
        mask: Option<&[bool]>,
        p: usize,
        n_components: usize,
    ) -> Result<ExtractionOutput> {
        self.run(RunMode::Patched, dataset, mask, p, n_components)
    }

    fn run(
        &self,
        mode: RunMode,
        dataset: &ImagingDataset,
        mask: Option<&[bool]>,
        p: usize,
        n_components: usize,
    ) -> Result<ExtractionOutput> {
        self.config.validate()?;
        if n_components == 0 {
            return Err(CnmfError::InvalidParameter(
                "at least one component must be requested".into(),
            ));
        }
        let t0 = Instant::now();
        info!(dataset = %dataset.name, mode = %mode, p, n_components, "Starting extraction");

        self.reporter.begin_stage(PipelineStage::Caching, None);
        let status = ensure_cache(dataset, mask, self.config.cache.force_conversion)?;
        if status == CacheStatus::Reused && mask.is_some() {
            info!("Array caches reused; the frame mask only applies when caches are built");
        }
        let recording = CachedArrays::open(dataset)?;
        self.reporter.finish_stage();
        let dims = recording.dims();

        let fingerprint = run_fingerprint(dataset, mask, mode, p, n_components, &self.config)?;
        let bundles = BundleStore::new(dataset, self.config.cache.reuse, fingerprint);

        let (bundle, reused_bundle) = match bundles.load_if_reusable()? {
            Some(bundle) => {
                bundle.validate(dims)?;
                (bundle, true)
            }
            None => {
                let bundle = self.factorize(mode, dataset, &recording, fingerprint, p, n_components)?;
                bundle.validate(dims)?;
                self.reporter.begin_stage(PipelineStage::Persisting, None);
                bundles.save(&bundle)?;
                if !self.config.cache.keep_checkpoints {
                    let snapshots = CheckpointStore::new(dataset, fingerprint, &self.config.cache);
                    if let Err(e) = snapshots.clear(stages_of(mode)) {
                        warn!(error = %e, "Could not remove stage snapshots");
                    }
                }
                self.reporter.finish_stage();
                (bundle, false)
            }
        };

        self.reporter.begin_stage(PipelineStage::Projection, None);
        let projection =
            projection::load_or_compute(dataset, &recording.cube()?, self.config.output.projection)?;
        self.reporter.finish_stage();

        self.reporter
            .begin_stage(PipelineStage::Contours, Some(bundle.n_components()));
        let rois = contours(
            bundle.a.view(),
            dims.height,
            dims.width,
            self.config.output.contour_threshold,
        )?;
        self.reporter.finish_stage();

        info!(
            dataset = %dataset.name,
            components = bundle.n_components(),
            reused_bundle,
            elapsed_s = t0.elapsed().as_secs_f64(),
            "Extraction complete"
        );

        let ResultBundle { a, c, yra, s, bl } = bundle;
        Ok(ExtractionOutput {
            rois,
            footprints: a,
            traces: c,
            spikes: s,
            residual: yra,
            baseline: bl,
            projection,
            recording,
            reused_bundle,
        })
    }

    /// Run the numeric stages inside a fresh worker pool.
    fn factorize(
        &self,
        mode: RunMode,
        dataset: &ImagingDataset,
        recording: &CachedArrays,
        fingerprint: Fingerprint,
        p: usize,
        n_components: usize,
    ) -> Result<ResultBundle> {
        if !self.library.is_available() {
            return Err(CnmfError::FactorizationUnavailable {
                backend: self.library.name().to_string(),
                operation: "preprocess",
            });
        }

        let store = CheckpointStore::new(dataset, fingerprint, &self.config.cache);
        let pool = WorkerPool::start(self.config.worker_count())?;
        let ctx = RunContext {
            library: self.library.as_ref(),
            pool: &pool,
            stages: StageRunner {
                store: &store,
                reporter: self.reporter.as_ref(),
            },
            recording,
            config: &self.config,
            p,
            n_components,
        };
        let result = match mode {
            RunMode::SinglePass => super::single::run(&ctx),
            RunMode::Patched => super::patched::run(&ctx),
        };
        pool.stop();
        result
    }
}

fn stages_of(mode: RunMode) -> &'static [PipelineStage] {
    match mode {
        RunMode::SinglePass => &PipelineStage::SINGLE_PASS,
        RunMode::Patched => &PipelineStage::PATCHED,
    }
}

/// Everything a numeric pass needs.
pub(super) struct RunContext<'a> {
    pub library: &'a dyn Factorization,
    pub pool: &'a WorkerPool,
    pub stages: StageRunner<'a>,
    pub recording: &'a CachedArrays,
    pub config: &'a PipelineConfig,
    pub p: usize,
    pub n_components: usize,
}

/// Runs one stage: restores its snapshot when valid, otherwise computes,
/// snapshots and logs it.
pub(super) struct StageRunner<'a> {
    store: &'a CheckpointStore,
    reporter: &'a dyn ProgressReporter,
}

impl StageRunner<'_> {
    pub fn run<T, F>(&self, stage: PipelineStage, total_items: Option<usize>, compute: F) -> Result<T>
    where
        T: Checkpoint,
        F: FnOnce() -> Result<T>,
    {
        self.reporter.begin_stage(stage, total_items);
        if let Some(value) = self.store.load::<T>(stage)? {
            info!(stage = %stage, "Restored stage from snapshot");
            self.reporter.finish_stage();
            return Ok(value);
        }

        let t0 = Instant::now();
        let value = compute()?;
        // A missing snapshot only costs a recompute on the next run.
        if let Err(e) = self.store.save(stage, &value) {
            warn!(stage = %stage, error = %e, "Could not write stage snapshot");
        }
        info!(
            stage = %stage,
            elapsed_s = t0.elapsed().as_secs_f64(),
            "Stage complete"
        );
        self.reporter.finish_stage();
        Ok(value)
    }

    pub fn reporter(&self) -> &dyn ProgressReporter {
        self.reporter
    }
}
