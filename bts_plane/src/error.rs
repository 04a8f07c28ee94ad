use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad selector names, activation names or accelerator visibility mismatches.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A feature reference in the manifest could not be resolved.
    #[error("data not found: {0}")]
    DataNotFound(String),

    #[error("corrupt snapshot '{path}': {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn corrupt_snapshot<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        Self::CorruptSnapshot {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
