//! Error types for the report store.
//!
//! None of these ever escape the capture path; they exist so the fallible
//! store operations can be composed with `?` and logged in one place.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure while persisting or retrieving a crash report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("i/o error on '{path}': {source}")]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The record could not be serialized.
    #[error("failed to serialize crash report: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The stored file is not a valid crash report.
    #[error("corrupt crash report '{path}': {source}")]
    Parse {
        /// Path of the rejected file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if this error means there simply was no report.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
