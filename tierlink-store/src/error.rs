//! Store error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the account store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate account number: {0}")]
    DuplicateAccount(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
