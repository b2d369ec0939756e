//! Errors raised by the pure event model.

use thiserror::Error;

use crate::event::{SourceSystem, WriteOperation};

#[derive(Debug, Error)]
pub enum CoreError {
    /// A write was attempted against a source the engine must not modify.
    #[error("cannot {operation} events owned by read-only source '{source_system}'")]
    ReadOnlySource {
        source_system: SourceSystem,
        operation: WriteOperation,
    },

    #[error("unknown source system '{0}'")]
    UnknownSourceSystem(String),

    #[error("unknown conflict type '{0}'")]
    UnknownConflictType(String),

    #[error("invalid event snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}
