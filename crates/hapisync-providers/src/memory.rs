//! In-memory calendar provider.
//!
//! Behaves like the Google client closely enough for orchestrator tests:
//! deleted events become `cancelled` tombstones, sync tokens only return
//! events changed since they were issued, and expired access tokens are
//! rejected. Failures can be injected per operation or per event summary,
//! and every calendar call can be slowed down to model a remote API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::error::{ProviderError, ProviderErrorCode, ProviderResult};
use crate::event::ProviderEvent;
use crate::google::tokens::{AccessToken, RefreshedToken};
use crate::provider::{
    BoxFuture, CalendarInfo, CalendarProvider, EventList, ListOptions, SendUpdates, WatchChannel,
    WatchRequest,
};

const SYNC_TOKEN_PREFIX: &str = "mem-";

#[derive(Debug, Clone)]
struct StoredEvent {
    event: ProviderEvent,
    changed_at: u64,
}

#[derive(Debug, Default)]
struct State {
    calendars: Vec<CalendarInfo>,
    events: HashMap<String, BTreeMap<String, StoredEvent>>,
    sequence: u64,
    next_id: u64,
    /// Sync tokens issued before this sequence number are rejected.
    token_floor: u64,
    failures: HashMap<String, (ProviderErrorCode, u32)>,
    failing_summaries: HashMap<String, ProviderErrorCode>,
    calls: HashMap<String, u32>,
    send_updates: Vec<SendUpdates>,
    channels: HashMap<String, WatchChannel>,
    refresh_error: Option<ProviderErrorCode>,
    refresh_count: u32,
    latency: StdDuration,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn record_call(&mut self, operation: &str) {
        *self.calls.entry(operation.to_string()).or_default() += 1;
    }

    fn injected_failure(&mut self, operation: &str, event: Option<&ProviderEvent>) -> ProviderResult<()> {
        if let Some((code, remaining)) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                let code = *code;
                return Err(ProviderError::new(code, format!("injected failure on {operation}"))
                    .with_provider("memory"));
            }
        }
        if let Some(summary) = event.and_then(|e| e.summary.as_deref()) {
            if let Some(code) = self.failing_summaries.get(summary) {
                return Err(ProviderError::new(*code, format!("injected failure for '{summary}'"))
                    .with_provider("memory"));
            }
        }
        Ok(())
    }

    fn live_event_mut(&mut self, calendar_id: &str, event_id: &str) -> ProviderResult<&mut StoredEvent> {
        self.events
            .get_mut(calendar_id)
            .and_then(|events| events.get_mut(event_id))
            .filter(|stored| !stored.event.is_cancelled())
            .ok_or_else(|| {
                ProviderError::not_found(format!("event {event_id} not found")).with_provider("memory")
            })
    }
}

/// A [`CalendarProvider`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<State>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.lock().calendars.push(
            CalendarInfo::new("primary", "Primary")
                .with_primary(true)
                .with_timezone("UTC"),
        );
        provider
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` calls of `operation` fail with `code`.
    pub fn fail_next(&self, operation: &str, code: ProviderErrorCode, count: u32) {
        self.lock()
            .failures
            .insert(operation.to_string(), (code, count));
    }

    /// Makes every write carrying this summary fail with `code`.
    pub fn fail_summary(&self, summary: &str, code: ProviderErrorCode) {
        self.lock()
            .failing_summaries
            .insert(summary.to_string(), code);
    }

    /// Makes refresh calls fail with `code`, or succeed again with `None`.
    pub fn set_refresh_error(&self, code: Option<ProviderErrorCode>) {
        self.lock().refresh_error = code;
    }

    /// Delays every calendar and channel call by `latency`.
    pub fn set_latency(&self, latency: StdDuration) {
        self.lock().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn call_count(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn refresh_count(&self) -> u32 {
        self.lock().refresh_count
    }

    /// Notification preferences of every write, in call order.
    pub fn send_updates_seen(&self) -> Vec<SendUpdates> {
        self.lock().send_updates.clone()
    }

    /// Rejects every sync token issued so far.
    pub fn expire_sync_tokens(&self) {
        let mut state = self.lock();
        state.token_floor = state.sequence + 1;
    }

    /// Live (non-cancelled) events of a calendar.
    pub fn events(&self, calendar_id: &str) -> Vec<ProviderEvent> {
        self.lock()
            .events
            .get(calendar_id)
            .map(|events| {
                events
                    .values()
                    .filter(|stored| !stored.event.is_cancelled())
                    .map(|stored| stored.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn event(&self, calendar_id: &str, event_id: &str) -> Option<ProviderEvent> {
        self.lock()
            .events
            .get(calendar_id)
            .and_then(|events| events.get(event_id))
            .map(|stored| stored.event.clone())
    }

    /// Inserts an event as if a user created it in the calendar UI.
    pub fn insert_external(&self, calendar_id: &str, mut event: ProviderEvent) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = event
            .id
            .clone()
            .unwrap_or_else(|| format!("ext-{}", state.next_id));
        event.id = Some(id.clone());
        event.status.get_or_insert_with(|| "confirmed".to_string());
        event.updated = Some(Utc::now());
        let changed_at = state.bump();
        state
            .events
            .entry(calendar_id.to_string())
            .or_default()
            .insert(id.clone(), StoredEvent { event, changed_at });
        id
    }

    /// Edits an event as a user would. Returns false if it does not exist.
    pub fn edit_external(
        &self,
        calendar_id: &str,
        event_id: &str,
        edit: impl FnOnce(&mut ProviderEvent),
    ) -> bool {
        let mut state = self.lock();
        let changed_at = state.bump();
        match state.live_event_mut(calendar_id, event_id) {
            Ok(stored) => {
                edit(&mut stored.event);
                stored.event.updated = Some(Utc::now());
                stored.changed_at = changed_at;
                true
            }
            Err(_) => false,
        }
    }

    /// Deletes an event as a user would, leaving a tombstone.
    pub fn delete_external(&self, calendar_id: &str, event_id: &str) -> bool {
        let mut state = self.lock();
        let changed_at = state.bump();
        match state.live_event_mut(calendar_id, event_id) {
            Ok(stored) => {
                stored.event.status = Some("cancelled".to_string());
                stored.changed_at = changed_at;
                true
            }
            Err(_) => false,
        }
    }

    pub fn active_channels(&self) -> Vec<WatchChannel> {
        self.lock().channels.values().cloned().collect()
    }

    fn list_events_now(
        &self,
        token: &AccessToken,
        calendar_id: &str,
        options: &ListOptions,
    ) -> ProviderResult<EventList> {
        token.ensure_fresh(Utc::now())?;
        let mut state = self.lock();
        state.record_call("list_events");
        state.injected_failure("list_events", None)?;

        let since = match options.sync_token.as_deref() {
            Some(sync_token) => {
                let since = sync_token
                    .strip_prefix(SYNC_TOKEN_PREFIX)
                    .and_then(|n| n.parse::<u64>().ok())
                    .filter(|n| *n >= state.token_floor)
                    .ok_or_else(|| {
                        ProviderError::new(ProviderErrorCode::SyncTokenExpired, "sync token expired")
                            .with_provider("memory")
                    })?;
                Some(since)
            }
            None => None,
        };

        let events = state
            .events
            .get(calendar_id)
            .map(|events| {
                events
                    .values()
                    .filter(|stored| match since {
                        Some(since) => stored.changed_at > since,
                        None => {
                            (options.show_deleted || !stored.event.is_cancelled())
                                && in_window(&stored.event, options)
                        }
                    })
                    .map(|stored| stored.event.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(EventList {
            events,
            next_sync_token: Some(format!("{SYNC_TOKEN_PREFIX}{}", state.sequence)),
        })
    }

    fn write_now(
        &self,
        operation: &str,
        token: &AccessToken,
        calendar_id: &str,
        event_id: Option<&str>,
        event: &ProviderEvent,
        send_updates: SendUpdates,
    ) -> ProviderResult<ProviderEvent> {
        token.ensure_fresh(Utc::now())?;
        let mut state = self.lock();
        state.record_call(operation);
        state.injected_failure(operation, Some(event))?;
        state.send_updates.push(send_updates);
        let changed_at = state.bump();

        let Some(event_id) = event_id else {
            state.next_id += 1;
            let id = format!("evt-{}", state.next_id);
            let mut created = event.clone();
            created.id = Some(id.clone());
            created.status = Some("confirmed".to_string());
            created.updated = Some(Utc::now());
            state
                .events
                .entry(calendar_id.to_string())
                .or_default()
                .insert(id, StoredEvent {
                    event: created.clone(),
                    changed_at,
                });
            return Ok(created);
        };

        let stored = state.live_event_mut(calendar_id, event_id)?;
        if operation == "patch_event" {
            merge_patch(&mut stored.event, event);
        } else {
            let mut replaced = event.clone();
            replaced.id = Some(event_id.to_string());
            replaced.status = Some("confirmed".to_string());
            stored.event = replaced;
        }
        stored.event.updated = Some(Utc::now());
        stored.changed_at = changed_at;
        Ok(stored.event.clone())
    }

    fn delete_now(
        &self,
        token: &AccessToken,
        calendar_id: &str,
        event_id: &str,
        send_updates: SendUpdates,
    ) -> ProviderResult<()> {
        token.ensure_fresh(Utc::now())?;
        let mut state = self.lock();
        state.record_call("delete_event");
        state.injected_failure("delete_event", None)?;
        state.send_updates.push(send_updates);
        let changed_at = state.bump();
        let stored = state.live_event_mut(calendar_id, event_id)?;
        stored.event.status = Some("cancelled".to_string());
        stored.changed_at = changed_at;
        Ok(())
    }

    fn simple_call(&self, operation: &str, token: Option<&AccessToken>) -> ProviderResult<MutexGuard<'_, State>> {
        if let Some(token) = token {
            token.ensure_fresh(Utc::now())?;
        }
        let mut state = self.lock();
        state.record_call(operation);
        state.injected_failure(operation, None)?;
        Ok(state)
    }
}

fn in_window(event: &ProviderEvent, options: &ListOptions) -> bool {
    let Some(window) = options.time_window.as_ref() else {
        return true;
    };
    let Some(start) = event.start.as_ref().and_then(|t| t.to_event_time()) else {
        return true;
    };
    let end = event
        .end
        .as_ref()
        .and_then(|t| t.to_event_time())
        .unwrap_or_else(|| start.default_end());
    window.overlaps_event(&start, &end)
}

fn merge_patch(target: &mut ProviderEvent, patch: &ProviderEvent) {
    if patch.summary.is_some() {
        target.summary = patch.summary.clone();
    }
    if patch.description.is_some() {
        target.description = patch.description.clone();
    }
    if patch.location.is_some() {
        target.location = patch.location.clone();
    }
    if patch.start.is_some() {
        target.start = patch.start.clone();
    }
    if patch.end.is_some() {
        target.end = patch.end.clone();
    }
    if patch.extended_properties.is_some() {
        target.extended_properties = patch.extended_properties.clone();
    }
}

impl CalendarProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_events<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        options: ListOptions,
    ) -> BoxFuture<'a, ProviderResult<EventList>> {
        Box::pin(async move {
            self.delay().await;
            self.list_events_now(token, calendar_id, &options)
        })
    }

    fn create_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(async move {
            self.delay().await;
            self.write_now("create_event", token, calendar_id, None, event, send_updates)
        })
    }

    fn update_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(async move {
            self.delay().await;
            self.write_now("update_event", token, calendar_id, Some(event_id), event, send_updates)
        })
    }

    fn patch_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        patch: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(async move {
            self.delay().await;
            self.write_now("patch_event", token, calendar_id, Some(event_id), patch, send_updates)
        })
    }

    fn delete_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event_id: &'a str,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.delay().await;
            self.delete_now(token, calendar_id, event_id, send_updates)
        })
    }

    fn list_calendars<'a>(
        &'a self,
        token: &'a AccessToken,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        Box::pin(async move {
            let state = self.simple_call("list_calendars", Some(token))?;
            Ok(state.calendars.clone())
        })
    }

    fn watch_calendar<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        request: &'a WatchRequest,
    ) -> BoxFuture<'a, ProviderResult<WatchChannel>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.simple_call("watch_calendar", Some(token))?;
            let ttl = Duration::from_std(request.ttl).unwrap_or_else(|_| Duration::days(7));
            let channel = WatchChannel {
                id: request.channel_id.clone(),
                resource_id: format!("res-{calendar_id}"),
                expiration: Some(Utc::now() + ttl),
            };
            state.channels.insert(channel.id.clone(), channel.clone());
            Ok(channel)
        })
    }

    fn stop_watching<'a>(
        &'a self,
        token: &'a AccessToken,
        channel_id: &'a str,
        _resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.delay().await;
            let mut state = self.simple_call("stop_watching", Some(token))?;
            state.channels.remove(channel_id);
            Ok(())
        })
    }

    fn refresh_access_token<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<RefreshedToken>> {
        Box::pin(async move {
            let mut state = self.simple_call("refresh_access_token", None)?;
            if let Some(code) = state.refresh_error {
                return Err(ProviderError::new(code, "refresh rejected").with_provider("memory"));
            }
            state.refresh_count += 1;
            Ok(RefreshedToken {
                access_token: format!("mem-access-{}", state.refresh_count),
                expires_in: Some(3600),
                refresh_token: None,
            })
        })
    }
}
