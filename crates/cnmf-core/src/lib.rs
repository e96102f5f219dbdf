pub mod cache;
pub mod consts;
pub mod contour;
pub mod dataset;
pub mod error;
pub mod factorization;
pub mod fingerprint;
pub mod io;
pub mod pipeline;
pub mod pool;

pub use cache::{ensure_cache, flat_index, CacheStatus, CachedArrays, RecordingDims};
pub use contour::{contours, RoiPolygon};
pub use dataset::{ImagingDataset, RawDtype, RawSource};
pub use error::{CnmfError, Result};
pub use factorization::{Factorization, MissingFactorization};
pub use pipeline::{ExtractionOutput, Extractor, PipelineConfig};
