//! Content fingerprints for change detection.
//!
//! The fingerprint covers title, description, start, end and location only.
//! Fields are encoded into a JSON object with sorted keys, so the result does
//! not depend on struct field order or on the timezone offset a source used.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::CanonicalEvent;

/// Hex-encoded SHA-256 of an event's canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wraps a stored hash value.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The byte string that gets hashed.
pub fn canonical_encoding(event: &CanonicalEvent) -> String {
    let mut fields: BTreeMap<&str, Option<String>> = BTreeMap::new();
    fields.insert("title", Some(event.title.clone()));
    fields.insert("description", event.description.clone());
    fields.insert("start", Some(event.start.canonical_string()));
    fields.insert("end", Some(event.end.canonical_string()));
    fields.insert("location", event.location.clone());
    // A map of strings cannot fail to serialise.
    serde_json::to_string(&fields).unwrap_or_default()
}

/// Computes the fingerprint of an event.
pub fn content_hash(event: &CanonicalEvent) -> ContentHash {
    let digest = Sha256::digest(canonical_encoding(event).as_bytes());
    ContentHash(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceSystem;
    use crate::time::EventTime;
    use chrono::{FixedOffset, TimeZone, Utc};

    fn midterm() -> CanonicalEvent {
        CanonicalEvent::new(
            SourceSystem::Lms,
            "lms-42",
            "CS101: Midterm",
            EventTime::from_utc(Utc.with_ymd_and_hms(2025, 4, 2, 13, 0, 0).unwrap()),
            None,
        )
        .with_location(Some("Hall B".into()))
    }

    #[test]
    fn encoding_is_sorted_and_stable() {
        insta::assert_snapshot!(
            canonical_encoding(&midterm()),
            @r#"{"description":null,"end":"2025-04-02T14:00:00Z","location":"Hall B","start":"2025-04-02T13:00:00Z","title":"CS101: Midterm"}"#
        );
    }

    #[test]
    fn hash_is_sha256_of_encoding() {
        assert_eq!(
            content_hash(&midterm()).as_str(),
            "6108c3f7f94942808cde44916433a40e5f5e7ba47ff82b8e795a7d4d3da86bb4"
        );
    }

    #[test]
    fn hash_ignores_identity_fields_and_offsets() {
        let a = midterm();
        let mut b = midterm();
        b.source_system = SourceSystem::External;
        b.source_id = "google-abc".into();
        let offset = FixedOffset::east_opt(3600).unwrap();
        b.start = EventTime::from_local(offset.with_ymd_and_hms(2025, 4, 2, 14, 0, 0).unwrap());
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_changes_with_any_content_field() {
        let base = content_hash(&midterm());

        let mut e = midterm();
        e.title.push('!');
        assert_ne!(content_hash(&e), base);

        let mut e = midterm();
        e.description = Some(String::new());
        assert_ne!(content_hash(&e), base);

        let mut e = midterm();
        e.location = None;
        assert_ne!(content_hash(&e), base);

        let mut e = midterm();
        e.end = EventTime::from_utc(Utc.with_ymd_and_hms(2025, 4, 2, 15, 0, 0).unwrap());
        assert_ne!(content_hash(&e), base);
    }
}
