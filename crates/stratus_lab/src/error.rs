//! Error types for the lab crate.

use stratus_core::CoreError;
use thiserror::Error;

/// Result type alias for lab operations.
pub type LabResult<T> = Result<T, LabError>;

/// Errors that can occur while loading lab settings or declaring a topology.
#[derive(Error, Debug)]
pub enum LabError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
