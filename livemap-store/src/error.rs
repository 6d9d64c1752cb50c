//! Error types for livemap-store.

use std::path::PathBuf;

use thiserror::Error;

/// A failure raised by one [`StoreObserver`](crate::StoreObserver) callback.
#[derive(Debug, Error)]
#[error("{observer} hook failed: {source}")]
pub struct HookError {
    pub observer: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl HookError {
    pub fn new(
        observer: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            observer,
            source: Box::new(source),
        }
    }
}

/// All errors that can arise from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key '{key}' not found in bucket {bucket}")]
    NotFound { bucket: String, key: String },

    /// The mutation on `key` was applied; one or more observers failed.
    #[error("{} hook(s) failed after mutating '{key}' in bucket {bucket}", errors.len())]
    Hooks {
        bucket: String,
        key: String,
        errors: Vec<HookError>,
    },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (bucket snapshots).
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot at {path} belongs to bucket {found}, expected {expected}")]
    BucketMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
