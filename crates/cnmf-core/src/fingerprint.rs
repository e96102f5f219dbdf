//! Content fingerprints for persisted results.
//!
//! A result file is trusted only when the sidecar written next to it holds
//! the fingerprint of the current run. Fingerprints are SipHash-1-3 with
//! fixed zero keys, so they are stable across processes and platforms.

use std::fmt;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use siphasher::sip::SipHasher13;
use tracing::debug;

use crate::consts::FINGERPRINT_EXTENSION;
use crate::dataset::{canonical_mask, ImagingDataset};
use crate::error::Result;
use crate::factorization::components_per_patch;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::types::RunMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Fingerprint of a sub-artifact (e.g. a stage snapshot) of this run.
    pub fn derive(&self, label: &str) -> Self {
        let mut b = FingerprintBuilder::new();
        b.u64(self.0).str(label);
        b.finish()
    }

    pub fn parse(text: &str) -> Option<Self> {
        u64::from_str_radix(text.trim(), 16).ok().map(Self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Incremental, length-prefixed hashing of run inputs.
pub struct FingerprintBuilder {
    hasher: SipHasher13,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: SipHasher13::new_with_keys(0, 0),
        }
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.hasher.write_u64(value);
        self
    }

    pub fn usize(&mut self, value: usize) -> &mut Self {
        self.u64(value as u64)
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.usize(bytes.len());
        self.hasher.write(bytes);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn path(&mut self, path: &Path) -> &mut Self {
        self.str(&path.to_string_lossy())
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.hasher.finish())
    }
}

/// Fingerprint of everything that determines a run's numeric result.
///
/// Covers the dataset identity (name, frame list, raw source), the
/// canonical exclusion mask, the run mode, the AR order, the requested
/// component count and the serialized numeric configuration. The worker
/// count is left out, so moving a recording to a host with a different
/// CPU count keeps its results valid unless it changes the per-patch
/// component count of a patched run.
pub fn run_fingerprint(
    dataset: &ImagingDataset,
    mask: Option<&[bool]>,
    mode: RunMode,
    p: usize,
    n_components: usize,
    config: &PipelineConfig,
) -> Result<Fingerprint> {
    let mut b = FingerprintBuilder::new();
    b.str(&dataset.name).usize(dataset.frames.len());
    for frame in &dataset.frames {
        b.path(frame);
    }
    match &dataset.raw {
        Some(raw) => {
            b.u64(1)
                .path(&raw.path)
                .usize(raw.height)
                .usize(raw.width)
                .str(&raw.dtype.to_string());
        }
        None => {
            b.u64(0);
        }
    }
    let mask = canonical_mask(mask);
    let packed: Vec<u8> = mask.iter().map(|&m| u8::from(m)).collect();

    // Cache and output settings do not change the factorization result, and
    // the worker count only matters through the per-patch component count.
    let numeric = PipelineConfig {
        workers: None,
        cache: Default::default(),
        output: Default::default(),
        ..config.clone()
    };
    b.bytes(&packed)
        .str(&mode.to_string())
        .usize(p)
        .usize(n_components)
        .str(&numeric.to_toml_string()?);
    if mode == RunMode::Patched {
        b.usize(components_per_patch(n_components, config.worker_count()));
    }
    Ok(b.finish())
}

/// `<artifact>` with its extension replaced by `.fingerprint`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    artifact.with_extension(FINGERPRINT_EXTENSION)
}

pub fn read_sidecar(artifact: &Path) -> Result<Option<Fingerprint>> {
    let path = sidecar_path(artifact);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(Fingerprint::parse(&text))
}

pub fn write_sidecar(artifact: &Path, fingerprint: Fingerprint) -> Result<()> {
    std::fs::write(sidecar_path(artifact), format!("{fingerprint}\n"))?;
    Ok(())
}

/// Drop the sidecar of an artifact about to be replaced, so the old
/// fingerprint can never vouch for new contents.
pub fn clear_sidecar(artifact: &Path) -> Result<()> {
    match std::fs::remove_file(sidecar_path(artifact)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// True when `artifact` exists and its sidecar holds `expected`.
pub fn artifact_matches(artifact: &Path, expected: Fingerprint) -> Result<bool> {
    if !artifact.exists() {
        return Ok(false);
    }
    let found = read_sidecar(artifact)?;
    if found != Some(expected) {
        debug!(
            artifact = %artifact.display(),
            expected = %expected,
            found = ?found.map(|f| f.to_string()),
            "Fingerprint mismatch"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Delete an artifact and its sidecar, ignoring files that are absent.
pub fn remove_with_sidecar(artifact: &Path) -> Result<()> {
    for path in [artifact.to_path_buf(), sidecar_path(artifact)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
