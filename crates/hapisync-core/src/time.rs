//! Event timestamps and query windows.
//!
//! An [`EventTime`] is either an instant or a whole day. A [`TimeWindow`]
//! bounds what a pass reads from a provider or from the datastore.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Start or end of an event.
///
/// Offsets reported by providers are dropped on the way in; everything timed
/// is kept in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    /// Whole-day event, no time of day.
    AllDay(NaiveDate),
}

impl EventTime {
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }

    /// Normalizes an offset-carrying instant to UTC.
    pub fn from_local<Tz: TimeZone>(dt: DateTime<Tz>) -> Self {
        Self::DateTime(dt.with_timezone(&Utc))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self::AllDay(date)
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, Self::AllDay(_))
    }

    /// Instant used for ordering and window checks. Whole days start at
    /// midnight UTC.
    pub fn to_utc_datetime(&self) -> DateTime<Utc> {
        match self {
            Self::DateTime(dt) => *dt,
            Self::AllDay(date) => date.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    /// Returns the default end for an event that only carries a start.
    ///
    /// Timed events last one hour; all-day events cover their single day.
    pub fn default_end(&self) -> Self {
        match self {
            Self::DateTime(dt) => Self::DateTime(*dt + Duration::hours(1)),
            Self::AllDay(date) => Self::AllDay(date.succ_opt().unwrap_or(*date)),
        }
    }

    /// Stable textual form used for hashing and storage.
    ///
    /// Instants are rendered as RFC 3339 in UTC with second precision, dates
    /// as `YYYY-MM-DD`, so the same moment always yields the same string
    /// regardless of the offset a provider reported it in.
    pub fn canonical_string(&self) -> String {
        match self {
            Self::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
            Self::AllDay(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

impl PartialOrd for EventTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_utc_datetime().cmp(&other.to_utc_datetime())
    }
}

/// Half-open UTC range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// # Panics
    ///
    /// If `start` is later than `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start <= end, "TimeWindow start must be <= end");
        Self { start, end }
    }

    /// Window of `duration` beginning at `now`.
    pub fn from_now(now: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(now, now + duration)
    }

    /// Creates a window reaching `lookback` into the past and `lookahead` into
    /// the future from `now`.
    pub fn around(now: DateTime<Utc>, lookback: Duration, lookahead: Duration) -> Self {
        Self::new(now - lookback, now + lookahead)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// `end` itself is outside the window.
    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }

    /// True when any part of the event falls inside the window. An event that
    /// ends exactly at `start` does not count.
    pub fn overlaps_event(&self, event_start: &EventTime, event_end: &EventTime) -> bool {
        let start = event_start.to_utc_datetime();
        let end = event_end.to_utc_datetime();
        start < self.end && end > self.start
    }
}
