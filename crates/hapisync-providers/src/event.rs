//! Typed event payload of the external calendar.
//!
//! Only the fields the engine reads or writes are modelled. Unknown fields
//! are ignored on read; absent fields are omitted on write, which makes the
//! same struct usable as a PATCH body.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use hapisync_core::{EventTime, SourceSystem};

/// Marker value stored in `hapiSync` on every event the engine writes.
pub const ENGINE_TAG: &str = "true";

/// An event as sent to or received from the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `confirmed`, `tentative` or `cancelled`. Deleted events come back as
    /// `cancelled` when listing with `showDeleted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<ProviderEventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<ProviderEventTime>,
    #[serde(skip_serializing)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub etag: Option<String>,
    #[serde(skip_serializing)]
    pub html_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
}

impl ProviderEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    fn engine_properties(&self) -> Option<&EngineProperties> {
        self.extended_properties.as_ref().map(|p| &p.private)
    }

    /// Whether this event was written by the sync engine.
    pub fn is_engine_authored(&self) -> bool {
        self.engine_properties()
            .and_then(|p| p.hapi_sync.as_deref())
            .is_some_and(|v| v == ENGINE_TAG)
    }

    /// The internal event an engine-authored event was created from.
    pub fn source_key(&self) -> Option<(SourceSystem, &str)> {
        let props = self.engine_properties()?;
        let system = props.hapi_source_system.as_deref()?.parse().ok()?;
        Some((system, props.hapi_source_id.as_deref()?))
    }

    /// Tags the event as written by the engine for the given internal event.
    pub fn tag_engine_source(&mut self, source_system: SourceSystem, source_id: &str) {
        self.extended_properties = Some(ExtendedProperties {
            private: EngineProperties {
                hapi_sync: Some(ENGINE_TAG.to_string()),
                hapi_source_system: Some(source_system.as_str().to_string()),
                hapi_source_id: Some(source_id.to_string()),
            },
        });
    }
}

/// Start or end of a provider event: `dateTime` for timed events, `date` for
/// all-day ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl ProviderEventTime {
    pub fn from_event_time(time: &EventTime, time_zone: Option<&str>) -> Self {
        match time {
            EventTime::DateTime(dt) => Self {
                date: None,
                date_time: Some(dt.fixed_offset()),
                time_zone: time_zone.map(str::to_string),
            },
            EventTime::AllDay(date) => Self {
                date: Some(*date),
                date_time: None,
                time_zone: None,
            },
        }
    }

    /// `dateTime` wins when both are present.
    pub fn to_event_time(&self) -> Option<EventTime> {
        match (self.date_time, self.date) {
            (Some(dt), _) => Some(EventTime::from_local(dt)),
            (None, Some(date)) => Some(EventTime::from_date(date)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default)]
    pub private: EngineProperties,
}

/// The private extended properties the engine reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProperties {
    #[serde(rename = "hapiSync", skip_serializing_if = "Option::is_none")]
    pub hapi_sync: Option<String>,
    #[serde(rename = "hapiSourceSystem", skip_serializing_if = "Option::is_none")]
    pub hapi_source_system: Option<String>,
    #[serde(rename = "hapiSourceId", skip_serializing_if = "Option::is_none")]
    pub hapi_source_id: Option<String>,
}
