//! Orchestrator error types.

use hapisync_core::CoreError;
use hapisync_providers::ProviderError;
use hapisync_store::StoreError;
use thiserror::Error;

/// Result type for orchestrator operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Message shown when the user has to authorize the calendar again.
pub const RECONNECT_MESSAGE: &str = "Calendar access expired. Please reconnect your account.";

/// Message shown for every other failure.
pub const RETRY_LATER_MESSAGE: &str = "Calendar sync failed. It will be retried later.";

/// Errors that can occur while synchronising.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A full sync for this user is already running.
    #[error("a sync is already in progress for user {user_id}")]
    AlreadyInProgress { user_id: String },

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// A write to the read-only source was attempted.
    #[error(transparent)]
    ReadOnlySource(#[from] CoreError),

    /// The connection was disconnected while the run was in progress.
    #[error("sync of connection {connection_id} was cancelled")]
    Cancelled { connection_id: String },

    /// The user's sync lease expired or was taken over mid-run.
    #[error("sync lease for user {user_id} was lost")]
    LeaseLost { user_id: String },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Stored credentials are unusable; the user must reconnect.
    #[error("credentials for connection {connection_id} are unusable: {message}")]
    Credentials {
        connection_id: String,
        message: String,
    },

    #[error("configuration error: {message}")]
    Config { message: String },

    /// Any other failure, attributed to the connection it happened on.
    #[error("sync of connection {connection_id} failed: {message}")]
    Sync {
        connection_id: String,
        message: String,
    },
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn credentials(connection_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Credentials {
            connection_id: connection_id.into(),
            message: message.into(),
        }
    }

    pub fn sync(connection_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sync {
            connection_id: connection_id.into(),
            message: message.into(),
        }
    }

    /// True when only a new authorization grant can fix the error.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::Credentials { .. } => true,
            Self::Provider(err) => err.is_auth(),
            _ => false,
        }
    }

    /// Text safe to show to end users. Provider bodies never appear here.
    pub fn user_message(&self) -> &'static str {
        if self.requires_reconnect() {
            RECONNECT_MESSAGE
        } else {
            RETRY_LATER_MESSAGE
        }
    }
}
