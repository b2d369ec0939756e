//! Core types: time, canonical events, transformers, hashing, conflict classification

pub mod diff;
pub mod error;
pub mod event;
pub mod hash;
pub mod time;
pub mod tracing;
pub mod transform;

pub use diff::{ConflictType, EventDiff, EventField, SideChange, classify_conflict, diff};
pub use error::CoreError;
pub use event::{
    CanonicalEvent, LmsEvent, SourceSystem, StudySession, WriteOperation, ensure_writable,
};
pub use hash::{ContentHash, canonical_encoding, content_hash};
pub use time::{EventTime, TimeWindow};
pub use self::tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
pub use transform::{lms_to_canonical, study_session_to_canonical};
