use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::{BUNDLE_SUFFIX, CUBE_SUFFIX, FLAT_SUFFIX, PROJECTION_SUFFIX};
use crate::error::Result;

/// Sample type of a contiguous raw recording.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawDtype {
    U8,
    #[default]
    U16,
    F32,
}

impl RawDtype {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }
}

impl fmt::Display for RawDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => write!(f, "uint8"),
            Self::U16 => write!(f, "uint16"),
            Self::F32 => write!(f, "float32"),
        }
    }
}

/// A single little-endian binary holding every frame back to back.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawSource {
    pub path: PathBuf,
    pub height: usize,
    pub width: usize,
    #[serde(default)]
    pub dtype: RawDtype,
}

impl RawSource {
    pub fn frame_byte_size(&self) -> usize {
        self.height * self.width * self.dtype.bytes_per_sample()
    }
}

/// A named recording together with the directory its caches live in.
///
/// The pipeline never modifies the dataset; every derived artifact is
/// written next to `cache_dir/name`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagingDataset {
    pub name: String,
    pub cache_dir: PathBuf,
    /// Ordered frame files (one image per frame).
    #[serde(default)]
    pub frames: Vec<PathBuf>,
    /// Optional raw binary; preferred over `frames` when it exists on disk.
    #[serde(default)]
    pub raw: Option<RawSource>,
}

impl ImagingDataset {
    pub fn new(name: impl Into<String>, cache_dir: impl Into<PathBuf>, frames: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cache_dir: cache_dir.into(),
            frames,
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: RawSource) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Build a dataset from every file in `frame_dir` with the given
    /// extension (case-insensitive), sorted by file name.
    pub fn discover(
        name: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        frame_dir: &Path,
        extension: &str,
    ) -> Result<Self> {
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(frame_dir)? {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension));
            if path.is_file() && matches {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(Self::new(name, cache_dir, frames))
    }

    /// True when a raw source is configured and present on disk.
    pub fn raw_available(&self) -> bool {
        self.raw.as_ref().is_some_and(|raw| raw.path.exists())
    }

    /// `cache_dir/name`, the prefix every artifact path is built from.
    pub fn cache_base(&self) -> PathBuf {
        self.cache_dir.join(&self.name)
    }

    pub fn artifact_path(&self, suffix: &str) -> PathBuf {
        let mut path = self.cache_base().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    pub fn cube_path(&self) -> PathBuf {
        self.artifact_path(CUBE_SUFFIX)
    }

    pub fn flat_path(&self) -> PathBuf {
        self.artifact_path(FLAT_SUFFIX)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.artifact_path(BUNDLE_SUFFIX)
    }

    pub fn projection_path(&self) -> PathBuf {
        self.artifact_path(PROJECTION_SUFFIX)
    }

    /// Snapshot path for one pipeline stage, e.g. `<base>_stage_merge.mat`.
    pub fn stage_path(&self, key: &str) -> PathBuf {
        self.artifact_path(&format!("_stage_{key}.mat"))
    }
}

/// Expand a frame-exclusion mask to `frame_count` entries.
///
/// `true` marks a frame as excluded. A short mask is padded with `false`
/// (keep); entries beyond `frame_count` are ignored.
pub fn expand_mask(mask: Option<&[bool]>, frame_count: usize) -> Vec<bool> {
    let mut full = vec![false; frame_count];
    if let Some(mask) = mask {
        for (slot, &excluded) in full.iter_mut().zip(mask) {
            *slot = excluded;
        }
    }
    full
}

/// Indices of the frames that survive the exclusion mask, in order.
pub fn kept_frames(mask: Option<&[bool]>, frame_count: usize) -> Vec<usize> {
    expand_mask(mask, frame_count)
        .into_iter()
        .enumerate()
        .filter_map(|(i, excluded)| (!excluded).then_some(i))
        .collect()
}

/// Canonical form of a mask for identity purposes: trailing `false`
/// entries carry no information under padding and are dropped.
pub fn canonical_mask(mask: Option<&[bool]>) -> &[bool] {
    let mask = mask.unwrap_or(&[]);
    let len = mask.iter().rposition(|&m| m).map_or(0, |i| i + 1);
    &mask[..len]
}
