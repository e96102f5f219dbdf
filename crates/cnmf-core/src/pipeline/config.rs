use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_CONTOUR_THRESHOLD, DEFAULT_GSIG, DEFAULT_INIT_ITERATIONS, DEFAULT_MAX_MERGE,
    DEFAULT_MEMORY_FACT, DEFAULT_MEMORY_SAFETY_FRAMES, DEFAULT_MERGE_THRESHOLD,
    DEFAULT_PATCH_HALF_SIZE, DEFAULT_PATCH_MERGE_THRESHOLD, DEFAULT_PATCH_STRIDE,
};
use crate::error::{CnmfError, Result};
use crate::pool::default_worker_count;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker count override. `None` uses half the available CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default)]
    pub components: ComponentConfig,
    #[serde(default)]
    pub single_pass: SinglePassConfig,
    #[serde(default)]
    pub patches: PatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count).max(1)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CnmfError::InvalidParameter(msg));
        if self.workers == Some(0) {
            return invalid("workers must be at least 1".into());
        }
        let thr = self.output.contour_threshold;
        if !(thr > 0.0 && thr <= 1.0) {
            return invalid(format!("output.contour_threshold must be in (0, 1], got {thr}"));
        }
        for (name, value) in [
            ("single_pass.merge_threshold", self.single_pass.merge_threshold),
            ("patches.merge_threshold", self.patches.merge_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be in [0, 1], got {value}"));
            }
        }
        let side = 2 * self.patches.half_size + 1;
        if self.patches.half_size == 0 || self.patches.stride >= side {
            return invalid(format!(
                "patches need half_size >= 1 and stride < {side}, got half_size={} stride={}",
                self.patches.half_size, self.patches.stride
            ));
        }
        if self.single_pass.ssub == 0
            || self.single_pass.tsub == 0
            || self.patches.ssub == 0
            || self.patches.tsub == 0
        {
            return invalid("subsampling factors must be at least 1".into());
        }
        Ok(())
    }
}

/// Component model shared by both passes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Gaussian half-width of a neuron in pixels, (rows, cols).
    pub gsig: [usize; 2],
    pub n_iter: usize,
    pub max_iter: usize,
    pub use_hals: bool,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            gsig: DEFAULT_GSIG,
            n_iter: DEFAULT_INIT_ITERATIONS,
            max_iter: DEFAULT_INIT_ITERATIONS,
            use_hals: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinglePassConfig {
    pub ssub: usize,
    pub tsub: usize,
    pub merge_threshold: f64,
    pub max_merge: usize,
    pub fast_merge: bool,
}

impl Default for SinglePassConfig {
    fn default() -> Self {
        Self {
            ssub: 2,
            tsub: 2,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            max_merge: DEFAULT_MAX_MERGE,
            fast_merge: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Patch half-size; patches are `2 * half_size + 1` pixels square.
    pub half_size: usize,
    /// Overlap between neighbouring patches, in pixels.
    pub stride: usize,
    pub memory_fact: f64,
    /// Recording length past which the global per-worker pixel budget shrinks.
    pub memory_safety_frames: f64,
    pub ssub: usize,
    pub tsub: usize,
    pub merge_threshold: f64,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            half_size: DEFAULT_PATCH_HALF_SIZE,
            stride: DEFAULT_PATCH_STRIDE,
            memory_fact: DEFAULT_MEMORY_FACT,
            memory_safety_frames: DEFAULT_MEMORY_SAFETY_FRAMES,
            ssub: 1,
            tsub: 1,
            merge_threshold: DEFAULT_PATCH_MERGE_THRESHOLD,
        }
    }
}

/// When a persisted result may be reused instead of recomputed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReusePolicy {
    /// Reuse only when the stored fingerprint matches the current run.
    #[default]
    Fingerprint,
    /// Reuse whenever the file exists, whatever produced it.
    Presence,
}

impl fmt::Display for ReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fingerprint => write!(f, "fingerprint"),
            Self::Presence => write!(f, "presence"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub reuse: ReusePolicy,
    /// Snapshot every numeric stage so an interrupted run can resume.
    pub checkpoints: bool,
    /// Leave stage snapshots on disk after the bundle is written.
    pub keep_checkpoints: bool,
    /// Rebuild the array caches even when they exist.
    pub force_conversion: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reuse: ReusePolicy::default(),
            checkpoints: true,
            keep_checkpoints: false,
            force_conversion: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionKind {
    #[default]
    Mean,
    Max,
    Std,
}

impl fmt::Display for ProjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Max => write!(f, "max"),
            Self::Std => write!(f, "std"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Cumulative-energy fraction enclosed by each ROI outline.
    pub contour_threshold: f64,
    pub projection: ProjectionKind,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            contour_threshold: DEFAULT_CONTOUR_THRESHOLD,
            projection: ProjectionKind::default(),
        }
    }
}
