//! Row types of the engine-owned tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hapisync_core::{ConflictType, ContentHash, SourceSystem};

use crate::error::StoreError;

/// Declares a string-backed status enum with `as_str`, `Display` and `FromStr`.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $column:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::invalid_value($column, other)),
                }
            }
        }
    };
}

text_enum!(
    /// Outcome of the most recent sync attempt on a connection.
    ConnectionSyncStatus, "last_sync_status" {
        Success => "success",
        Partial => "partial",
        Error => "error",
    }
);

text_enum!(
    MappingStatus, "sync_status" {
        Synced => "synced",
        Pending => "pending",
        Conflict => "conflict",
        Error => "error",
    }
);

text_enum!(
    /// Which side produced the version currently recorded on a mapping.
    ModifiedBy, "last_modified_by" {
        Hapi => "hapi",
        External => "external",
    }
);

text_enum!(
    RunType, "run_type" {
        Full => "full",
        Incremental => "incremental",
    }
);

text_enum!(
    RunStatus, "status" {
        Started => "started",
        Completed => "completed",
        Failed => "failed",
        Partial => "partial",
    }
);

text_enum!(
    ResolutionStatus, "resolution_status" {
        Pending => "pending",
        Resolved => "resolved",
        Ignored => "ignored",
        AutoResolved => "auto_resolved",
    }
);

text_enum!(
    ResolutionAction, "resolution_action" {
        KeptSource => "kept_source",
        KeptExternal => "kept_external",
        Dismissed => "dismissed",
    }
);

/// Which directions are synchronised for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncToggles {
    pub lms_events: bool,
    pub study_sessions: bool,
    pub external_events: bool,
}

impl Default for SyncToggles {
    fn default() -> Self {
        Self {
            lms_events: true,
            study_sessions: true,
            external_events: true,
        }
    }
}

impl SyncToggles {
    pub fn enabled(&self, source: SourceSystem) -> bool {
        match source {
            SourceSystem::Lms => self.lms_events,
            SourceSystem::StudySession => self.study_sessions,
            SourceSystem::External => self.external_events,
        }
    }
}

/// A registered push-notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRegistration {
    pub channel_id: String,
    pub resource_id: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// One user's link to an external calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarConnection {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub account_email: Option<String>,
    pub calendar_id: String,
    pub timezone: Option<String>,
    pub toggles: SyncToggles,
    /// Sealed access/refresh token pair.
    pub encrypted_credentials: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<ConnectionSyncStatus>,
    /// User-facing message only; raw provider bodies never land here.
    pub last_sync_error: Option<String>,
    pub channel: Option<ChannelRegistration>,
    /// Provider incremental-listing token for the external-to-internal pass.
    pub sync_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a connection.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: String,
    pub provider: String,
    pub account_email: Option<String>,
    pub calendar_id: String,
    pub timezone: Option<String>,
    pub toggles: SyncToggles,
    pub encrypted_credentials: String,
}

/// Correlation between one internal event and its external copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMapping {
    /// Row id; zero until the mapping is first stored.
    pub id: i64,
    pub user_id: String,
    pub connection_id: String,
    pub source_system: SourceSystem,
    pub source_id: String,
    pub external_event_id: Option<String>,
    pub hapi_version_hash: Option<ContentHash>,
    pub external_version_hash: Option<ContentHash>,
    pub sync_status: MappingStatus,
    pub last_modified_by: Option<ModifiedBy>,
    pub hapi_deleted: bool,
    pub external_deleted: bool,
    /// Canonical JSON of each side at the last successful sync.
    pub hapi_snapshot: Option<String>,
    pub external_snapshot: Option<String>,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl EventMapping {
    pub fn new(
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
        source_system: SourceSystem,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            source_system,
            source_id: source_id.into(),
            external_event_id: None,
            hapi_version_hash: None,
            external_version_hash: None,
            sync_status: MappingStatus::Pending,
            last_modified_by: None,
            hapi_deleted: false,
            external_deleted: false,
            hapi_snapshot: None,
            external_snapshot: None,
            last_error: None,
            last_synced_at: None,
        }
    }

    /// Both sides are gone; nothing is left to synchronise.
    pub fn is_retired(&self) -> bool {
        self.hapi_deleted && (self.external_deleted || self.external_event_id.is_none())
    }
}

/// Counters aggregated over a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub events_created: u32,
    pub events_updated: u32,
    pub events_deleted: u32,
    pub conflicts: u32,
    pub errors: u32,
}

impl SyncStats {
    pub fn merge(&mut self, other: &SyncStats) {
        self.events_created += other.events_created;
        self.events_updated += other.events_updated;
        self.events_deleted += other.events_deleted;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }

    pub fn writes(&self) -> u32 {
        self.events_created + self.events_updated + self.events_deleted
    }
}

/// One orchestration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRun {
    pub id: i64,
    pub user_id: String,
    /// Set for incremental runs, which cover a single connection.
    pub connection_id: Option<String>,
    pub run_type: RunType,
    pub status: RunStatus,
    pub stats: SyncStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_summary: Option<String>,
}

/// A change observed on both sides of a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    pub id: i64,
    pub mapping_id: i64,
    pub user_id: String,
    pub connection_id: String,
    pub conflict_type: ConflictType,
    pub hapi_snapshot: Option<String>,
    pub external_snapshot: Option<String>,
    pub status: ResolutionStatus,
    pub resolution_action: Option<ResolutionAction>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewConflict {
    pub mapping_id: i64,
    pub conflict_type: ConflictType,
    pub hapi_snapshot: Option<String>,
    pub external_snapshot: Option<String>,
    pub status: ResolutionStatus,
    pub resolution_action: Option<ResolutionAction>,
}

/// An external event copied into the internal store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedEvent {
    pub connection_id: String,
    pub external_event_id: String,
    pub user_id: String,
    pub event: hapisync_core::CanonicalEvent,
    pub content_hash: ContentHash,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}
