//! Column encodings shared by the table modules.
//!
//! Timestamps are stored as fixed-width RFC 3339 text in UTC, so they sort
//! lexicographically. Event times keep their all-day flag in a separate
//! column.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

use hapisync_core::EventTime;

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_ts(idx, &value)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_ts(idx, &v)).transpose()
}

/// Reads a text column through `FromStr`.
pub(crate) fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.get(idx)?;
    value.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| v.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Encodes an event time as `(text, all_day)`.
pub(crate) fn event_time(time: &EventTime) -> (String, bool) {
    match time {
        EventTime::DateTime(dt) => (ts(*dt), false),
        EventTime::AllDay(date) => (date.format("%Y-%m-%d").to_string(), true),
    }
}

/// UTC bounds of an event as sortable text, for window queries. A missing
/// end falls back to [`EventTime::default_end`].
pub(crate) fn span(start: &EventTime, end: Option<&EventTime>) -> (String, String) {
    let end = end.copied().unwrap_or_else(|| start.default_end());
    (ts(start.to_utc_datetime()), ts(end.to_utc_datetime()))
}

pub(crate) fn get_event_time(row: &Row<'_>, idx: usize, all_day: bool) -> rusqlite::Result<EventTime> {
    let value: String = row.get(idx)?;
    decode_event_time(idx, &value, all_day)
}

pub(crate) fn get_opt_event_time(
    row: &Row<'_>,
    idx: usize,
    all_day: bool,
) -> rusqlite::Result<Option<EventTime>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| decode_event_time(idx, &v, all_day))
        .transpose()
}

fn decode_event_time(idx: usize, value: &str, all_day: bool) -> rusqlite::Result<EventTime> {
    if all_day {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(EventTime::from_date)
            .map_err(|e| conversion_error(idx, e))
    } else {
        parse_ts(idx, value).map(EventTime::from_utc)
    }
}
