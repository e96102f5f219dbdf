//! Per-stage snapshots.
//!
//! Every numeric stage writes its output to `<base>_stage_<key>.mat` with a
//! fingerprint sidecar. A later run with the same fingerprint loads the
//! snapshot instead of calling the library, so an interrupted run resumes
//! after its last completed stage.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use tracing::{debug, warn};

use crate::dataset::ImagingDataset;
use crate::error::{CnmfError, Result};
use crate::factorization::{
    InitialComponents, MergedComponents, NoiseEstimate, PatchComponents, SpatialUpdate,
    TemporalUpdate,
};
use crate::fingerprint::{
    artifact_matches, clear_sidecar, remove_with_sidecar, write_sidecar, Fingerprint,
};
use crate::io::mat::MatFile;

use super::config::{CacheConfig, ReusePolicy};
use super::types::PipelineStage;

/// A stage output that can be stored as named matrices.
pub trait Checkpoint: Sized {
    fn to_mat(&self) -> MatFile;
    fn from_mat(mat: MatFile, origin: &Path) -> Result<Self>;
}

/// Permutation returned by the ordering stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentOrder(pub Vec<usize>);

fn insert_optional_vector(mat: &mut MatFile, name: &str, value: Option<&Array1<f64>>) {
    if let Some(v) = value {
        mat.insert_vector(name, v);
    }
}

fn indices_to_row(indices: &[usize]) -> Array1<f64> {
    indices.iter().map(|&i| i as f64).collect()
}

fn row_to_indices(row: impl IntoIterator<Item = f64>, name: &str, origin: &Path) -> Result<Vec<usize>> {
    row.into_iter()
        .filter(|v| !v.is_nan())
        .map(|v| {
            if v >= 0.0 && v.fract() == 0.0 {
                Ok(v as usize)
            } else {
                Err(CnmfError::InvalidMat {
                    path: origin.to_path_buf(),
                    reason: format!("'{name}' holds non-index value {v}"),
                })
            }
        })
        .collect()
}

impl Checkpoint for NoiseEstimate {
    fn to_mat(&self) -> MatFile {
        let mut mat = MatFile::new();
        mat.insert_vector("sn", &self.sn);
        mat.insert("g", self.g.clone());
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        Ok(Self {
            sn: mat.take_vector("sn", origin)?,
            g: mat.take_matrix("g", origin)?,
        })
    }
}

impl Checkpoint for InitialComponents {
    fn to_mat(&self) -> MatFile {
        let mut mat = MatFile::new();
        mat.insert_sparse("A", self.a.clone());
        mat.insert("C", self.c.clone());
        mat.insert("b", self.b.clone());
        mat.insert("f", self.f.clone());
        mat.insert("centers", self.centers.clone());
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        Ok(Self {
            a: mat.take_matrix("A", origin)?,
            c: mat.take_matrix("C", origin)?,
            b: mat.take_matrix("b", origin)?,
            f: mat.take_matrix("f", origin)?,
            centers: mat.take_matrix("centers", origin)?,
        })
    }
}

impl Checkpoint for SpatialUpdate {
    fn to_mat(&self) -> MatFile {
        let mut mat = MatFile::new();
        mat.insert_sparse("A", self.a.clone());
        mat.insert("b", self.b.clone());
        mat.insert("C", self.c.clone());
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        Ok(Self {
            a: mat.take_matrix("A", origin)?,
            b: mat.take_matrix("b", origin)?,
            c: mat.take_matrix("C", origin)?,
        })
    }
}

impl Checkpoint for TemporalUpdate {
    fn to_mat(&self) -> MatFile {
        let mut mat = MatFile::new();
        mat.insert("C", self.c.clone());
        mat.insert("f", self.f.clone());
        mat.insert("S", self.s.clone());
        mat.insert_vector("bl", &self.bl);
        mat.insert_vector("c1", &self.c1);
        mat.insert_vector("neurons_sn", &self.neurons_sn);
        mat.insert("g", self.g.clone());
        mat.insert("YrA", self.yra.clone());
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        Ok(Self {
            c: mat.take_matrix("C", origin)?,
            f: mat.take_matrix("f", origin)?,
            s: mat.take_matrix("S", origin)?,
            bl: mat.take_vector("bl", origin)?,
            c1: mat.take_vector("c1", origin)?,
            neurons_sn: mat.take_vector("neurons_sn", origin)?,
            g: mat.take_matrix("g", origin)?,
            yra: mat.take_matrix("YrA", origin)?,
        })
    }
}

impl Checkpoint for MergedComponents {
    fn to_mat(&self) -> MatFile {
        let mut mat = MatFile::new();
        mat.insert_sparse("A", self.a.clone());
        mat.insert("C", self.c.clone());
        mat.insert("S", self.s.clone());

        // Groups are rows, padded with NaN to the longest group.
        let width = self.merged.iter().map(Vec::len).max().unwrap_or(0);
        let mut groups = Array2::from_elem((self.merged.len(), width), f64::NAN);
        for (mut row, group) in groups.rows_mut().into_iter().zip(&self.merged) {
            for (slot, &i) in row.iter_mut().zip(group) {
                *slot = i as f64;
            }
        }
        mat.insert("merged", groups);

        insert_optional_vector(&mut mat, "bl", self.bl.as_ref());
        insert_optional_vector(&mut mat, "c1", self.c1.as_ref());
        insert_optional_vector(&mut mat, "neurons_sn", self.neurons_sn.as_ref());
        if let Some(g) = &self.g {
            mat.insert("g", g.clone());
        }
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        let groups = mat.take_matrix("merged", origin)?;
        let merged = groups
            .rows()
            .into_iter()
            .map(|row| row_to_indices(row.iter().copied(), "merged", origin))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            a: mat.take_matrix("A", origin)?,
            c: mat.take_matrix("C", origin)?,
            s: mat.take_matrix("S", origin)?,
            merged,
            bl: mat.take_optional_vector("bl", origin)?,
            c1: mat.take_optional_vector("c1", origin)?,
            neurons_sn: mat.take_optional_vector("neurons_sn", origin)?,
            g: mat.take("g"),
        })
    }
}

impl Checkpoint for PatchComponents {
    fn to_mat(&self) -> MatFile {
        // Lifted footprints and backgrounds are zero outside their patch.
        let mut mat = MatFile::new();
        mat.insert_sparse("A", self.a.clone());
        mat.insert("C", self.c.clone());
        mat.insert_sparse("b", self.b.clone());
        mat.insert("f", self.f.clone());
        mat.insert_vector("sn", &self.sn);
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        Ok(Self {
            a: mat.take_matrix("A", origin)?,
            c: mat.take_matrix("C", origin)?,
            b: mat.take_matrix("b", origin)?,
            f: mat.take_matrix("f", origin)?,
            sn: mat.take_vector("sn", origin)?,
        })
    }
}

impl Checkpoint for ComponentOrder {
    fn to_mat(&self) -> MatFile {
        let mut mat = MatFile::new();
        mat.insert_vector("order", &indices_to_row(&self.0));
        mat
    }

    fn from_mat(mut mat: MatFile, origin: &Path) -> Result<Self> {
        let row = mat.take_vector("order", origin)?;
        Ok(Self(row_to_indices(row.iter().copied(), "order", origin)?))
    }
}

/// Location and validity rules for the stage snapshots of one run.
pub struct CheckpointStore {
    dataset: ImagingDataset,
    run: Fingerprint,
    policy: ReusePolicy,
    enabled: bool,
}

impl CheckpointStore {
    pub fn new(dataset: &ImagingDataset, run: Fingerprint, cache: &CacheConfig) -> Self {
        Self {
            dataset: dataset.clone(),
            run,
            policy: cache.reuse,
            enabled: cache.checkpoints,
        }
    }

    pub fn path(&self, stage: PipelineStage) -> Option<PathBuf> {
        stage.checkpoint_key().map(|key| self.dataset.stage_path(key))
    }

    fn stage_fingerprint(&self, key: &str) -> Fingerprint {
        self.run.derive(key)
    }

    /// Load a valid snapshot of `stage`, if there is one.
    ///
    /// A snapshot that fails to decode is treated as absent.
    pub fn load<T: Checkpoint>(&self, stage: PipelineStage) -> Result<Option<T>> {
        let (Some(key), true) = (stage.checkpoint_key(), self.enabled) else {
            return Ok(None);
        };
        let path = self.dataset.stage_path(key);
        let valid = match self.policy {
            ReusePolicy::Presence => path.exists(),
            ReusePolicy::Fingerprint => artifact_matches(&path, self.stage_fingerprint(key))?,
        };
        if !valid {
            return Ok(None);
        }
        match MatFile::load(&path).and_then(|mat| T::from_mat(mat, &path)) {
            Ok(value) => {
                debug!(stage = %stage, path = %path.display(), "Loaded stage snapshot");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(stage = %stage, error = %e, "Discarding unreadable stage snapshot");
                Ok(None)
            }
        }
    }

    pub fn save<T: Checkpoint>(&self, stage: PipelineStage, value: &T) -> Result<()> {
        let (Some(key), true) = (stage.checkpoint_key(), self.enabled) else {
            return Ok(());
        };
        let path = self.dataset.stage_path(key);
        clear_sidecar(&path)?;
        value.to_mat().save(&path)?;
        // Sidecar last: its presence means the snapshot is complete.
        write_sidecar(&path, self.stage_fingerprint(key))?;
        debug!(stage = %stage, path = %path.display(), "Saved stage snapshot");
        Ok(())
    }

    /// Remove the snapshots of `stages`.
    pub fn clear(&self, stages: &[PipelineStage]) -> Result<()> {
        for stage in stages {
            if let Some(path) = self.path(*stage) {
                remove_with_sidecar(&path)?;
            }
        }
        Ok(())
    }
}
