//! Error types for livemap-db.

use thiserror::Error;

use livemap_core::SourceError;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },

    /// Marker payload column.
    #[error("marker payload JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<DbError> for SourceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::InvalidData(message) => SourceError::InvalidData(message),
            other => SourceError::backend(other),
        }
    }
}
