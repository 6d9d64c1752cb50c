use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use livemap_broker::BrokerError;
use livemap_core::{ConfigError, MarkerId, SourceError};

/// Stable error codes carried in failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PermissionDenied,
    InvalidRequest,
    NotFound,
    StreamClosed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "livemap.permission_denied",
            ErrorCode::InvalidRequest => "livemap.invalid_request",
            ErrorCode::NotFound => "livemap.not_found",
            ErrorCode::StreamClosed => "livemap.stream_closed",
            ErrorCode::Internal => "livemap.internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surface for the daemon runtime and the socket client.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Db(#[from] livemap_db::DbError),

    #[error("store error: {0}")]
    Store(#[from] livemap_store::StoreError),

    #[error("tracker error: {0}")]
    Tracker(#[from] livemap_tracker::TrackerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// A failed response from the daemon.
    #[error("{message} ({code})")]
    Remote { code: String, message: String },

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// Ends one client stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no visible jobs for user {0}")]
    PermissionDenied(livemap_core::UserId),

    /// The client went away or a send failed.
    #[error("stream closed")]
    Closed,

    #[error("marker query failed: {0}")]
    Source(#[from] SourceError),

    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl StreamError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            StreamError::Closed => ErrorCode::StreamClosed,
            StreamError::Source(_) | StreamError::Broker(_) | StreamError::Join(_) => {
                ErrorCode::Internal
            }
        }
    }
}

/// Rejects one marker command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("marker {0} not found")]
    NotFound(MarkerId),

    #[error("storage error: {0}")]
    Source(#[from] SourceError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CommandError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            CommandError::NotFound(_) | CommandError::Source(SourceError::NotFound { .. }) => {
                ErrorCode::NotFound
            }
            CommandError::Source(_) | CommandError::Join(_) => ErrorCode::Internal,
        }
    }
}
