//! Source-agnostic event representation.
//!
//! Three systems own events: the academic LMS feed (read-only), the internal
//! study-session store, and the external calendar. Each is normalised into a
//! [`CanonicalEvent`] before hashing and diffing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::time::EventTime;

/// The system that owns an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    /// Academic LMS feed. The engine never edits or deletes these.
    Lms,
    /// Study sessions owned by this application.
    StudySession,
    /// Events created directly in the external calendar.
    External,
}

impl SourceSystem {
    /// All source systems, in the order a full pass visits them.
    pub const ALL: [SourceSystem; 3] = [Self::Lms, Self::StudySession, Self::External];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lms => "lms",
            Self::StudySession => "study_session",
            Self::External => "external",
        }
    }

    /// Whether the engine may write changes back to this source.
    pub fn editable(&self) -> bool {
        !matches!(self, Self::Lms)
    }

    /// Whether the engine may delete events owned by this source.
    pub fn deletable(&self) -> bool {
        self.editable()
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSystem {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lms" => Ok(Self::Lms),
            "study_session" => Ok(Self::StudySession),
            "external" => Ok(Self::External),
            other => Err(CoreError::UnknownSourceSystem(other.to_string())),
        }
    }
}

/// A write the engine wants to perform against an internal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Update,
    Delete,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Rejects writes against a read-only source.
///
/// Must be checked before any internal-side mutation reaches the datastore.
pub fn ensure_writable(source: SourceSystem, operation: WriteOperation) -> Result<(), CoreError> {
    let allowed = match operation {
        WriteOperation::Update => source.editable(),
        WriteOperation::Delete => source.deletable(),
    };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::ReadOnlySource {
            source_system: source,
            operation,
        })
    }
}

/// The normalised shape used for hashing and diffing.
///
/// Not persisted as such; rebuilt from each source on every pass. Mappings
/// keep a JSON snapshot so later passes can tell which fields moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub title: String,
    pub description: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    pub location: Option<String>,
    pub source_system: SourceSystem,
    /// Identifier native to the owning source.
    pub source_id: String,
    pub editable: bool,
    pub deletable: bool,
}

impl CanonicalEvent {
    /// Creates an event with no description or location.
    ///
    /// A missing `end` defaults to [`EventTime::default_end`].
    pub fn new(
        source_system: SourceSystem,
        source_id: impl Into<String>,
        title: impl Into<String>,
        start: EventTime,
        end: Option<EventTime>,
    ) -> Self {
        Self {
            title: title.into(),
            description: None,
            start,
            end: end.unwrap_or_else(|| start.default_end()),
            location: None,
            source_system,
            source_id: source_id.into(),
            editable: source_system.editable(),
            deletable: source_system.deletable(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    /// Whether the event is an all-day event.
    pub fn is_all_day(&self) -> bool {
        self.start.is_all_day()
    }
}

/// An assignment, exam or lecture from the LMS feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmsEvent {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Course label shown in front of the title, e.g. `CS101`.
    pub course_code: Option<String>,
    pub location: Option<String>,
    pub start: EventTime,
    pub end: Option<EventTime>,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

/// A study session planned inside the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub start: EventTime,
    pub end: Option<EventTime>,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}
