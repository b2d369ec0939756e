//! CLI error types.

use hapisync_core::TracingError;
use hapisync_providers::ProviderError;
use hapisync_server::SyncError;
use hapisync_store::StoreError;
use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that end a CLI command.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to resolve secret: {0}")]
    Secret(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("datastore error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("logging setup failed: {0}")]
    Tracing(#[from] TracingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
