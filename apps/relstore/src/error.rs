//! # CLI Errors

use relstore_core::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can make a command fail.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid schema file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A file exceeds the size accepted for its kind.
    #[error("File {path:?} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    /// The schema file parsed but describes something unusable.
    #[error("Invalid schema: {0}")]
    Config(String),

    /// A script operation could not be applied.
    #[error("Script operation {index} failed: {reason}")]
    Script { index: usize, reason: String },
}
