use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use tracing::{debug, info};

use crate::cache::RecordingDims;
use crate::dataset::ImagingDataset;
use crate::error::{CnmfError, Result};
use crate::fingerprint::{
    artifact_matches, clear_sidecar, remove_with_sidecar, write_sidecar, Fingerprint,
};
use crate::io::mat::MatFile;

use super::config::ReusePolicy;

/// The persisted result of a run: everything needed to skip the numeric
/// stages on the next invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultBundle {
    /// Spatial footprints, pixels × K.
    pub a: Array2<f64>,
    /// Denoised traces, K × T.
    pub c: Array2<f64>,
    /// Residual traces, K × T.
    pub yra: Array2<f64>,
    /// Deconvolved activity, K × T.
    pub s: Array2<f64>,
    /// Baseline per component.
    pub bl: Array1<f64>,
}

impl ResultBundle {
    pub fn n_components(&self) -> usize {
        self.a.ncols()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut mat = MatFile::new();
        mat.insert_sparse("A", self.a.clone());
        mat.insert("C", self.c.clone());
        mat.insert("YrA", self.yra.clone());
        mat.insert("S", self.s.clone());
        mat.insert_vector("bl", &self.bl);
        mat.save(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut mat = MatFile::load(path)?;
        Ok(Self {
            a: mat.take_matrix("A", path)?,
            c: mat.take_matrix("C", path)?,
            yra: mat.take_matrix("YrA", path)?,
            s: mat.take_matrix("S", path)?,
            bl: mat.take_vector("bl", path)?,
        })
    }

    /// Check the bundle against the recording it claims to describe.
    pub fn validate(&self, dims: RecordingDims) -> Result<()> {
        let k = self.n_components();
        if self.a.nrows() != dims.pixels() {
            return Err(CnmfError::DimensionMismatch(format!(
                "A has {} rows, recording has {} pixels",
                self.a.nrows(),
                dims.pixels()
            )));
        }
        for (name, m) in [("C", &self.c), ("S", &self.s), ("YrA", &self.yra)] {
            if m.dim() != (k, dims.frames) {
                return Err(CnmfError::DimensionMismatch(format!(
                    "{name} is {:?}, expected ({k}, {})",
                    m.dim(),
                    dims.frames
                )));
            }
        }
        if self.bl.len() != k {
            return Err(CnmfError::DimensionMismatch(format!(
                "bl has {} entries for {k} components",
                self.bl.len()
            )));
        }
        Ok(())
    }

    /// Apply a component permutation: entry `i` of `order` is the index of
    /// the component placed at position `i`.
    pub fn reordered(&self, order: &[usize]) -> Self {
        Self {
            a: self.a.select(Axis(1), order),
            c: self.c.select(Axis(0), order),
            yra: self.yra.select(Axis(0), order),
            s: self.s.select(Axis(0), order),
            bl: self.bl.select(Axis(0), order),
        }
    }
}

/// Where a dataset's bundle lives and when it may be trusted.
pub struct BundleStore<'a> {
    dataset: &'a ImagingDataset,
    policy: ReusePolicy,
    fingerprint: Fingerprint,
}

impl<'a> BundleStore<'a> {
    pub fn new(dataset: &'a ImagingDataset, policy: ReusePolicy, fingerprint: Fingerprint) -> Self {
        Self {
            dataset,
            policy,
            fingerprint,
        }
    }

    pub fn is_reusable(&self) -> Result<bool> {
        let path = self.dataset.bundle_path();
        match self.policy {
            ReusePolicy::Presence => Ok(path.exists()),
            ReusePolicy::Fingerprint => artifact_matches(&path, self.fingerprint),
        }
    }

    /// Load the bundle if the reuse policy allows it.
    pub fn load_if_reusable(&self) -> Result<Option<ResultBundle>> {
        if !self.is_reusable()? {
            debug!(policy = %self.policy, "No reusable result bundle");
            return Ok(None);
        }
        let path = self.dataset.bundle_path();
        let bundle = ResultBundle::load(&path)?;
        info!(
            path = %path.display(),
            components = bundle.n_components(),
            "Reusing stored result bundle"
        );
        Ok(Some(bundle))
    }

    pub fn save(&self, bundle: &ResultBundle) -> Result<()> {
        let path = self.dataset.bundle_path();
        clear_sidecar(&path)?;
        bundle.save(&path)?;
        write_sidecar(&path, self.fingerprint)?;
        info!(
            path = %path.display(),
            components = bundle.n_components(),
            "Result bundle written"
        );
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        remove_with_sidecar(&self.dataset.bundle_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn bundle() -> ResultBundle {
        ResultBundle {
            a: array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            c: array![[1.0], [2.0], [3.0]],
            yra: array![[10.0], [20.0], [30.0]],
            s: array![[0.1], [0.2], [0.3]],
            bl: array![7.0, 8.0, 9.0],
        }
    }

    #[test]
    fn test_reordered_moves_every_field() {
        let r = bundle().reordered(&[2, 0, 1]);
        assert_eq!(r.a, array![[3.0, 1.0, 2.0], [6.0, 4.0, 5.0]]);
        assert_eq!(r.c, array![[3.0], [1.0], [2.0]]);
        assert_eq!(r.yra, array![[30.0], [10.0], [20.0]]);
        assert_eq!(r.bl, array![9.0, 7.0, 8.0]);
    }

    #[test]
    fn test_validate_dims() {
        let dims = RecordingDims {
            height: 1,
            width: 2,
            frames: 1,
        };
        assert!(bundle().validate(dims).is_ok());
        let wrong = RecordingDims { frames: 2, ..dims };
        assert!(bundle().validate(wrong).is_err());
    }
}
