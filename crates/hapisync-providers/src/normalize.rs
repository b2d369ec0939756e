//! Conversion between [`CanonicalEvent`] and [`ProviderEvent`].

use hapisync_core::transform::clean_text;
use hapisync_core::{CanonicalEvent, SourceSystem};

use crate::event::{ProviderEvent, ProviderEventTime};

/// Builds the provider payload for an internal event.
///
/// The payload is tagged with the engine marker and the internal source key
/// so that the external-to-internal pass can recognise it later.
pub fn to_provider_event(event: &CanonicalEvent, time_zone: Option<&str>) -> ProviderEvent {
    let mut out = ProviderEvent {
        summary: Some(event.title.clone()),
        description: event.description.clone(),
        location: event.location.clone(),
        start: Some(ProviderEventTime::from_event_time(&event.start, time_zone)),
        end: Some(ProviderEventTime::from_event_time(&event.end, time_zone)),
        ..Default::default()
    };
    out.tag_engine_source(event.source_system, &event.source_id);
    out
}

/// Normalises a provider event.
///
/// Returns `None` for events without an id or start time; those cannot be
/// mapped. Cancelled events still normalise so callers can see tombstones.
pub fn from_provider_event(event: &ProviderEvent) -> Option<CanonicalEvent> {
    let id = event.id.as_deref()?;
    let start = event.start.as_ref()?.to_event_time()?;
    let end = event.end.as_ref().and_then(ProviderEventTime::to_event_time);
    let title = event.summary.as_deref().map(str::trim).unwrap_or_default();

    Some(
        CanonicalEvent::new(SourceSystem::External, id, title, start, end)
            .with_description(clean_text(event.description.as_deref()))
            .with_location(clean_text(event.location.as_deref())),
    )
}
