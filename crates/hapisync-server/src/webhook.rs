//! Push notifications and the incremental-pass queue.
//!
//! Each connection has at most one incremental pass running and at most one
//! queued behind it. Notifications arriving while a pass is queued are
//! folded into it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::RunReport;

/// A push notification as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookNotification {
    pub channel_id: String,
    pub resource_id: String,
    /// `sync` for the handshake sent on registration, `exists` for changes.
    pub resource_state: String,
}

impl WebhookNotification {
    pub const CHANNEL_HEADER: &'static str = "x-goog-channel-id";
    pub const RESOURCE_HEADER: &'static str = "x-goog-resource-id";
    pub const STATE_HEADER: &'static str = "x-goog-resource-state";

    pub fn new(
        channel_id: impl Into<String>,
        resource_id: impl Into<String>,
        resource_state: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            resource_id: resource_id.into(),
            resource_state: resource_state.into(),
        }
    }

    /// Builds a notification from request headers. Header names are matched
    /// case-insensitively; returns `None` when one is missing.
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Option<Self> {
        let mut channel_id = None;
        let mut resource_id = None;
        let mut resource_state = None;
        for (name, value) in headers {
            let slot = if name.eq_ignore_ascii_case(Self::CHANNEL_HEADER) {
                &mut channel_id
            } else if name.eq_ignore_ascii_case(Self::RESOURCE_HEADER) {
                &mut resource_id
            } else if name.eq_ignore_ascii_case(Self::STATE_HEADER) {
                &mut resource_state
            } else {
                continue;
            };
            *slot = Some(value.trim().to_string());
        }
        Some(Self {
            channel_id: channel_id?,
            resource_id: resource_id?,
            resource_state: resource_state?,
        })
    }

    /// The handshake notification carries no changes.
    pub fn is_handshake(&self) -> bool {
        self.resource_state == "sync"
    }
}

/// What happened to a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Unknown or stale channel, or a handshake.
    Ignored,
    /// Folded into a pass that is running or queued for the connection.
    Coalesced,
    /// An incremental pass ran; the report is the last one run.
    Processed(RunReport),
}

#[derive(Debug, Default)]
pub(crate) struct IncrementalQueue {
    /// Connection id to "another pass requested" flag.
    slots: Mutex<HashMap<String, bool>>,
}

impl IncrementalQueue {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the pass slot of a connection. Returns `None` if a pass is
    /// already running; the request is then recorded for it to pick up.
    pub(crate) fn admit(&self, connection_id: &str) -> Option<Admission<'_>> {
        let mut slots = self.slots();
        match slots.get_mut(connection_id) {
            Some(pending) => {
                *pending = true;
                None
            }
            None => {
                slots.insert(connection_id.to_string(), false);
                Some(Admission {
                    queue: self,
                    connection_id: connection_id.to_string(),
                    released: false,
                })
            }
        }
    }
}

/// Ownership of a connection's pass slot. Dropping it frees the slot.
pub(crate) struct Admission<'a> {
    queue: &'a IncrementalQueue,
    connection_id: String,
    released: bool,
}

impl Admission<'_> {
    /// True if notifications arrived during the last pass, in which case the
    /// caller runs once more. Otherwise the slot is freed atomically.
    pub(crate) fn rerun(&mut self) -> bool {
        let mut slots = self.queue.slots();
        match slots.get_mut(&self.connection_id) {
            Some(pending) if *pending => {
                *pending = false;
                true
            }
            _ => {
                slots.remove(&self.connection_id);
                self.released = true;
                false
            }
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.queue.slots().remove(&self.connection_id);
        }
    }
}
