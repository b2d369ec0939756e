//! Field-level diffing and conflict classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::event::CanonicalEvent;

/// A content field of a [`CanonicalEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    Title,
    Description,
    Start,
    End,
    Location,
}

impl EventField {
    pub fn is_time(&self) -> bool {
        matches!(self, Self::Start | Self::End)
    }
}

/// Result of comparing two versions of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDiff {
    pub changed_fields: Vec<EventField>,
}

impl EventDiff {
    pub fn changed(&self) -> bool {
        !self.changed_fields.is_empty()
    }

    pub fn touches_time(&self) -> bool {
        self.changed_fields.iter().any(EventField::is_time)
    }

    /// True when location is the only field that moved.
    pub fn location_only(&self) -> bool {
        self.changed_fields == [EventField::Location]
    }
}

/// Compares the content fields of two events.
pub fn diff(old: &CanonicalEvent, new: &CanonicalEvent) -> EventDiff {
    let mut changed_fields = Vec::new();
    if old.title != new.title {
        changed_fields.push(EventField::Title);
    }
    if old.description != new.description {
        changed_fields.push(EventField::Description);
    }
    if old.start != new.start {
        changed_fields.push(EventField::Start);
    }
    if old.end != new.end {
        changed_fields.push(EventField::End);
    }
    if old.location != new.location {
        changed_fields.push(EventField::Location);
    }
    EventDiff { changed_fields }
}

/// What happened to one side of a mapping since the last sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChange {
    Unchanged,
    /// Content hash moved. The diff is empty when no prior snapshot exists.
    Modified(EventDiff),
    Deleted,
}

impl SideChange {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Kind of a recorded sync conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    TimeChange,
    ContentChange,
    LocationChange,
    DeletionConflict,
    DuplicateEvent,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeChange => "time_change",
            Self::ContentChange => "content_change",
            Self::LocationChange => "location_change",
            Self::DeletionConflict => "deletion_conflict",
            Self::DuplicateEvent => "duplicate_event",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_change" => Ok(Self::TimeChange),
            "content_change" => Ok(Self::ContentChange),
            "location_change" => Ok(Self::LocationChange),
            "deletion_conflict" => Ok(Self::DeletionConflict),
            "duplicate_event" => Ok(Self::DuplicateEvent),
            other => Err(CoreError::UnknownConflictType(other.to_string())),
        }
    }
}

/// Classifies a change observed on both sides of a mapping.
///
/// Only meaningful when neither side is [`SideChange::Unchanged`]; a
/// single-sided change is a plain update. Deletion on either side wins over
/// field-level classification.
pub fn classify_conflict(internal: &SideChange, external: &SideChange) -> ConflictType {
    match (internal, external) {
        (SideChange::Deleted, _) | (_, SideChange::Deleted) => ConflictType::DeletionConflict,
        (SideChange::Modified(a), SideChange::Modified(b)) => {
            if a.touches_time() && b.touches_time() {
                ConflictType::TimeChange
            } else if a.location_only() && b.location_only() {
                ConflictType::LocationChange
            } else {
                ConflictType::ContentChange
            }
        }
        _ => ConflictType::ContentChange,
    }
}
