//! CalendarProvider trait definition.
//!
//! [`CalendarProvider`] is the seam between the orchestrator and the external
//! calendar. Every call takes an [`AccessToken`] resolved by the caller; the
//! provider never refreshes credentials on its own.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use hapisync_core::TimeWindow;

use crate::error::{ProviderError, ProviderResult};
use crate::event::ProviderEvent;
use crate::google::tokens::{AccessToken, RefreshedToken};
use crate::retry::RetryPolicy;

/// Information about a calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_primary: bool,
    /// IANA timezone of the calendar.
    pub timezone: Option<String>,
    /// `owner`, `writer`, `reader` or `freeBusyReader`.
    pub access_role: Option<String>,
}

impl CalendarInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            is_primary: false,
            timezone: None,
            access_role: None,
        }
    }

    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Whether the engine can write events into this calendar.
    pub fn is_writable(&self) -> bool {
        matches!(self.access_role.as_deref(), Some("owner" | "writer") | None)
    }
}

/// Who the provider notifies about an automated write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendUpdates {
    All,
    ExternalOnly,
    /// The engine always uses this for its own writes.
    #[default]
    None,
}

impl SendUpdates {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::ExternalOnly => "externalOnly",
            Self::None => "none",
        }
    }
}

impl fmt::Display for SendUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for listing events.
///
/// A sync token and a time window are mutually exclusive on the provider
/// side; when a sync token is set the window is not sent.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub time_window: Option<TimeWindow>,
    pub sync_token: Option<String>,
    /// Include cancelled events so deletions are visible.
    pub show_deleted: bool,
    /// Only events modified after this instant.
    pub updated_min: Option<DateTime<Utc>>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn with_sync_token(mut self, token: impl Into<String>) -> Self {
        self.sync_token = Some(token.into());
        self
    }

    pub fn with_show_deleted(mut self, show: bool) -> Self {
        self.show_deleted = show;
        self
    }

    pub fn with_updated_min(mut self, updated_min: DateTime<Utc>) -> Self {
        self.updated_min = Some(updated_min);
        self
    }
}

/// All pages of a list request.
#[derive(Debug, Clone, Default)]
pub struct EventList {
    pub events: Vec<ProviderEvent>,
    /// Token for the next incremental listing, present on the last page.
    pub next_sync_token: Option<String>,
}

/// A push-notification channel registration request.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// Caller-chosen unique channel id.
    pub channel_id: String,
    pub webhook_url: String,
    pub ttl: std::time::Duration,
}

/// An active push-notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchChannel {
    pub id: String,
    pub resource_id: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// A boxed future for async trait methods.
///
/// Boxed futures keep the trait object-safe so the orchestrator can hold an
/// `Arc<dyn CalendarProvider>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The external calendar the engine synchronises with.
///
/// Implementations classify failures into [`ProviderError`] codes but do not
/// retry; wrap them in [`RetryingProvider`] for the retry policy.
pub trait CalendarProvider: Send + Sync {
    /// Returns the provider name (e.g. `"google"`).
    fn name(&self) -> &str;

    /// Lists events, following pagination up to the provider's page ceiling.
    fn list_events<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        options: ListOptions,
    ) -> BoxFuture<'a, ProviderResult<EventList>>;

    fn create_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>>;

    /// Full replace.
    fn update_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>>;

    /// Partial update; only fields set on `patch` are sent.
    fn patch_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        patch: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>>;

    fn delete_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<()>>;

    fn list_calendars<'a>(
        &'a self,
        token: &'a AccessToken,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>>;

    /// Registers a push-notification channel on a calendar.
    fn watch_calendar<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        request: &'a WatchRequest,
    ) -> BoxFuture<'a, ProviderResult<WatchChannel>>;

    /// Tears down a channel. Succeeds if the channel is already gone.
    fn stop_watching<'a>(
        &'a self,
        token: &'a AccessToken,
        channel_id: &'a str,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>>;

    /// Exchanges a refresh token for a new access token.
    ///
    /// Only the orchestrator's token manager calls this, under a
    /// per-connection lock. A rejected refresh yields `AuthExpired`.
    fn refresh_access_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<RefreshedToken>>;
}

impl<P: CalendarProvider + ?Sized> CalendarProvider for std::sync::Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn list_events<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        options: ListOptions,
    ) -> BoxFuture<'a, ProviderResult<EventList>> {
        (**self).list_events(token, calendar_id, options)
    }

    fn create_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        (**self).create_event(token, calendar_id, event, send_updates)
    }

    fn update_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        (**self).update_event(token, calendar_id, event_id, event, send_updates)
    }

    fn patch_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        patch: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        (**self).patch_event(token, calendar_id, event_id, patch, send_updates)
    }

    fn delete_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        (**self).delete_event(token, calendar_id, event_id, send_updates)
    }

    fn list_calendars<'a>(
        &'a self,
        token: &'a AccessToken,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        (**self).list_calendars(token)
    }

    fn watch_calendar<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        request: &'a WatchRequest,
    ) -> BoxFuture<'a, ProviderResult<WatchChannel>> {
        (**self).watch_calendar(token, calendar_id, request)
    }

    fn stop_watching<'a>(
        &'a self,
        token: &'a AccessToken,
        channel_id: &'a str,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        (**self).stop_watching(token, channel_id, resource_id)
    }

    fn refresh_access_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<RefreshedToken>> {
        (**self).refresh_access_token(refresh_token)
    }
}

/// Applies a [`RetryPolicy`] to every call of the wrapped provider.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: CalendarProvider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<P: CalendarProvider> CalendarProvider for RetryingProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_events<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        options: ListOptions,
    ) -> BoxFuture<'a, ProviderResult<EventList>> {
        Box::pin(self.policy.run("list_events", move || {
            self.inner.list_events(token, calendar_id, options.clone())
        }))
    }

    fn create_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(self.policy.run("create_event", move || {
            self.inner.create_event(token, calendar_id, event, send_updates)
        }))
    }

    fn update_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(self.policy.run("update_event", move || {
            self.inner.update_event(token, calendar_id, event_id, event, send_updates)
        }))
    }

    fn patch_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        patch: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(self.policy.run("patch_event", move || {
            self.inner.patch_event(token, calendar_id, event_id, patch, send_updates)
        }))
    }

    fn delete_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.policy.run("delete_event", move || {
            self.inner.delete_event(token, calendar_id, event_id, send_updates)
        }))
    }

    fn list_calendars<'a>(
        &'a self,
        token: &'a AccessToken,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        Box::pin(
            self.policy
                .run("list_calendars", move || self.inner.list_calendars(token)),
        )
    }

    fn watch_calendar<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        request: &'a WatchRequest,
    ) -> BoxFuture<'a, ProviderResult<WatchChannel>> {
        Box::pin(self.policy.run("watch_calendar", move || {
            self.inner.watch_calendar(token, calendar_id, request)
        }))
    }

    fn stop_watching<'a>(
        &'a self,
        token: &'a AccessToken,
        channel_id: &'a str,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.policy.run("stop_watching", move || {
            self.inner.stop_watching(token, channel_id, resource_id)
        }))
    }

    fn refresh_access_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<RefreshedToken>> {
        Box::pin(self.policy.run("refresh_access_token", move || {
            self.inner.refresh_access_token(refresh_token)
        }))
    }
}

/// A provider that fails every call with the same error.
///
/// Stands in for the real provider when credentials are not configured, so
/// the engine still starts and reports a clear error per connection.
#[derive(Debug)]
pub struct ErrorProvider {
    name: String,
    error: ProviderError,
}

impl ErrorProvider {
    pub fn new(name: impl Into<String>, error: ProviderError) -> Self {
        Self {
            name: name.into(),
            error,
        }
    }

    fn fail<'a, T: Send + 'a>(&self) -> BoxFuture<'a, ProviderResult<T>> {
        let error = self.error.duplicate().with_provider(&self.name);
        Box::pin(async move { Err(error) })
    }
}

impl CalendarProvider for ErrorProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_events<'a>(
        &'a self,
        _token: &'a AccessToken,
        _calendar_id: &'a str,
        _options: ListOptions,
    ) -> BoxFuture<'a, ProviderResult<EventList>> {
        self.fail()
    }

    fn create_event<'a>(
        &'a self,
        _token: &'a AccessToken,
        _calendar_id: &'a str,
        _event: &'a ProviderEvent,
        _send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        self.fail()
    }

    fn update_event<'a>(
        &'a self,
        _token: &'a AccessToken,
        _calendar_id: &'a str,
        _event_id: &'a str,
        _event: &'a ProviderEvent,
        _send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        self.fail()
    }

    fn patch_event<'a>(
        &'a self,
        _token: &'a AccessToken,
        _calendar_id: &'a str,
        _event_id: &'a str,
        _patch: &'a ProviderEvent,
        _send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        self.fail()
    }

    fn delete_event<'a>(
        &'a self,
        _token: &'a AccessToken,
        _calendar_id: &'a str,
        _event_id: &'a str,
        _send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        self.fail()
    }

    fn list_calendars<'a>(
        &'a self,
        _token: &'a AccessToken,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        self.fail()
    }

    fn watch_calendar<'a>(
        &'a self,
        _token: &'a AccessToken,
        _calendar_id: &'a str,
        _request: &'a WatchRequest,
    ) -> BoxFuture<'a, ProviderResult<WatchChannel>> {
        self.fail()
    }

    fn stop_watching<'a>(
        &'a self,
        _token: &'a AccessToken,
        _channel_id: &'a str,
        _resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        self.fail()
    }

    fn refresh_access_token<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<RefreshedToken>> {
        self.fail()
    }
}
