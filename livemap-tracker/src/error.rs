//! Error types for livemap-tracker.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use livemap_core::{SourceError, UserId};
use livemap_store::StoreError;

/// All errors that can arise from tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The authoritative query failed; nothing of the cycle was applied.
    #[error("location query failed: {0}")]
    Source(#[from] SourceError),

    /// Resolving one user's unit assignment failed.
    #[error("unit lookup failed: {0}")]
    Units(SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error (postal table).
    #[error("postal table JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Convenience constructor for [`TrackerError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TrackerError {
    TrackerError::Io {
        path: path.into(),
        source,
    }
}

/// Per-user failures collected over one cycle. The rest of the cycle still
/// ran.
#[derive(Debug, Default)]
pub struct CycleErrors {
    pub errors: Vec<(UserId, TrackerError)>,
}

impl CycleErrors {
    pub fn push(&mut self, user_id: UserId, err: impl Into<TrackerError>) {
        self.errors.push((user_id, err.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

impl fmt::Display for CycleErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} user(s) failed", self.errors.len())?;
        for (user_id, err) in self.errors.iter().take(3) {
            write!(f, "; {user_id}: {err}")?;
        }
        if self.errors.len() > 3 {
            write!(f, "; +{} more", self.errors.len() - 3)?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleErrors {}
