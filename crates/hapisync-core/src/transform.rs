//! Mapping native source rows into [`CanonicalEvent`]s.
//!
//! All functions here are pure. Conversions to and from the external provider
//! shape live next to the provider types in `hapisync-providers`.

use crate::error::CoreError;
use crate::event::{CanonicalEvent, LmsEvent, SourceSystem, StudySession};

/// Trims a free-text field, mapping blank values to `None`.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Normalises an LMS row.
///
/// The course code, when present, prefixes the title (`CS101: Midterm`).
pub fn lms_to_canonical(event: &LmsEvent) -> CanonicalEvent {
    let title = event.title.trim();
    let title = match clean_text(event.course_code.as_deref()) {
        Some(code) => format!("{code}: {title}"),
        None => title.to_string(),
    };
    CanonicalEvent::new(SourceSystem::Lms, &event.id, title, event.start, event.end)
        .with_description(clean_text(event.description.as_deref()))
        .with_location(clean_text(event.location.as_deref()))
}

/// Normalises a study session. Session notes become the description.
pub fn study_session_to_canonical(session: &StudySession) -> CanonicalEvent {
    CanonicalEvent::new(
        SourceSystem::StudySession,
        &session.id,
        session.title.trim(),
        session.start,
        session.end,
    )
    .with_description(clean_text(session.notes.as_deref()))
    .with_location(clean_text(session.location.as_deref()))
}

/// Serialises a canonical event for storage on a mapping row.
pub fn to_snapshot(event: &CanonicalEvent) -> Result<String, CoreError> {
    Ok(serde_json::to_string(event)?)
}

pub fn from_snapshot(snapshot: &str) -> Result<CanonicalEvent, CoreError> {
    Ok(serde_json::from_str(snapshot)?)
}
