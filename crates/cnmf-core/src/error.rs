use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CnmfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image format error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Invalid NPY file {path}: {reason}")]
    InvalidNpy { path: PathBuf, reason: String },

    #[error("Invalid MAT file {path}: {reason}")]
    InvalidMat { path: PathBuf, reason: String },

    #[error("Missing variable '{name}' in {path}")]
    MissingVariable { path: PathBuf, name: String },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported pixel format {format} in {path}")]
    UnsupportedPixelFormat { path: PathBuf, format: String },

    #[error("Empty frame sequence")]
    EmptySequence,

    #[error("Factorization backend '{backend}' is unavailable (needed for {operation})")]
    FactorizationUnavailable {
        backend: String,
        operation: &'static str,
    },

    #[error("Factorization error in {operation}: {message}")]
    Factorization {
        operation: &'static str,
        message: String,
    },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, CnmfError>;
