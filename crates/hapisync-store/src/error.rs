//! Store error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid value for {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("sync run {0} is already finalized")]
    RunFinalized(i64),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("datastore call exceeded {0:?}")]
    Timeout(Duration),

    #[error("datastore task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_value(column: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            column,
            value: value.into(),
        }
    }

    /// True for failures that clear up on their own: `SQLITE_BUSY`,
    /// `SQLITE_LOCKED`, pool exhaustion and call timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Pool(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}
