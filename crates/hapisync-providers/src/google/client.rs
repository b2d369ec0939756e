//! Google Calendar API client.
//!
//! Implements [`CalendarProvider`] over the Calendar v3 REST surface. Errors
//! are classified from the HTTP status; retrying is left to
//! [`RetryingProvider`](crate::provider::RetryingProvider).

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderErrorCode, ProviderResult};
use crate::event::ProviderEvent;
use crate::provider::{
    BoxFuture, CalendarInfo, CalendarProvider, EventList, ListOptions, SendUpdates, WatchChannel,
    WatchRequest,
};

use super::config::GoogleConfig;
use super::oauth::OAuthClient;
use super::tokens::{AccessToken, RefreshedToken};

const PROVIDER_NAME: &str = "google";

#[derive(Debug)]
pub struct GoogleCalendarClient {
    http_client: reqwest::Client,
    config: GoogleConfig,
    oauth: OAuthClient,
}

impl GoogleCalendarClient {
    pub fn new(config: GoogleConfig) -> ProviderResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| ProviderError::configuration(format!("failed to create HTTP client: {e}")))?;
        let oauth = OAuthClient::new(&config)?;
        Ok(Self {
            http_client,
            config,
            oauth,
        })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.config.api_base_url,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        )
    }

    /// Sends a request and turns non-success statuses into errors.
    ///
    /// The raw error body is logged here and kept only in the error message.
    async fn send(&self, token: &AccessToken, request: RequestBuilder) -> ProviderResult<Response> {
        token.ensure_fresh(Utc::now())?;

        let response = request
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %body, "calendar API error");
        Err(ProviderError::from_status(status.as_u16(), &body, retry_after).with_provider(PROVIDER_NAME))
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        serde_json::from_str(&body).map_err(|e| {
            ProviderError::invalid_response(format!("failed to parse response: {e}"))
                .with_provider(PROVIDER_NAME)
        })
    }

    async fn list_events_page(
        &self,
        token: &AccessToken,
        calendar_id: &str,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> ProviderResult<EventListResponse> {
        let mut query: Vec<(&str, String)> = vec![
            ("maxResults", self.config.page_size.to_string()),
            ("singleEvents", "true".to_string()),
            ("showDeleted", options.show_deleted.to_string()),
        ];
        match (&options.sync_token, &options.time_window) {
            (Some(sync_token), _) => query.push(("syncToken", sync_token.clone())),
            (None, Some(window)) => {
                query.push(("timeMin", window.start.to_rfc3339()));
                query.push(("timeMax", window.end.to_rfc3339()));
            }
            (None, None) => {}
        }
        if options.sync_token.is_none() {
            if let Some(updated_min) = options.updated_min {
                query.push(("updatedMin", updated_min.to_rfc3339()));
            }
        }
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token.to_string()));
        }

        let request = self.http_client.get(self.events_url(calendar_id)).query(&query);
        match self.send(token, request).await {
            Ok(response) => Self::parse(response).await,
            Err(err) if options.sync_token.is_some() && err.status() == Some(410) => {
                Err(ProviderError::new(
                    ProviderErrorCode::SyncTokenExpired,
                    "sync token is no longer valid, full listing required",
                )
                .with_provider(PROVIDER_NAME))
            }
            Err(err) => Err(err),
        }
    }

    async fn list_events_impl(
        &self,
        token: &AccessToken,
        calendar_id: &str,
        options: ListOptions,
    ) -> ProviderResult<EventList> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut next_sync_token = None;

        for page in 1..=self.config.max_pages {
            let response = self
                .list_events_page(token, calendar_id, &options, page_token.as_deref())
                .await?;
            events.extend(response.items);

            match response.next_page_token {
                Some(next) => {
                    if page == self.config.max_pages {
                        warn!(calendar_id, pages = page, "page ceiling reached, listing truncated");
                    }
                    page_token = Some(next);
                }
                None => {
                    next_sync_token = response.next_sync_token;
                    break;
                }
            }
        }

        debug!(calendar_id, count = events.len(), "listed events");
        Ok(EventList {
            events,
            next_sync_token,
        })
    }

    async fn list_calendars_impl(&self, token: &AccessToken) -> ProviderResult<Vec<CalendarInfo>> {
        let url = format!("{}/users/me/calendarList", self.config.api_base_url);
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..self.config.max_pages {
            let mut request = self.http_client.get(&url);
            if let Some(ref page_token) = page_token {
                request = request.query(&[("pageToken", page_token)]);
            }
            let list: CalendarListResponse = Self::parse(self.send(token, request).await?).await?;
            calendars.extend(list.items.into_iter().map(CalendarInfo::from));
            match list.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(calendars)
    }

    async fn watch_impl(
        &self,
        token: &AccessToken,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> ProviderResult<WatchChannel> {
        let body = WatchRequestBody {
            id: &request.channel_id,
            kind: "web_hook",
            address: &request.webhook_url,
            params: WatchParams {
                ttl: request.ttl.as_secs().to_string(),
            },
        };
        let url = format!("{}/watch", self.events_url(calendar_id));
        let response = self
            .send(token, self.http_client.post(url).json(&body))
            .await?;
        let channel: WatchResponse = Self::parse(response).await?;
        Ok(WatchChannel {
            id: channel.id,
            resource_id: channel.resource_id,
            expiration: channel.expiration.as_deref().and_then(parse_millis),
        })
    }

    async fn stop_impl(
        &self,
        token: &AccessToken,
        channel_id: &str,
        resource_id: &str,
    ) -> ProviderResult<()> {
        let url = format!("{}/channels/stop", self.config.api_base_url);
        let body = serde_json::json!({ "id": channel_id, "resourceId": resource_id });
        match self.send(token, self.http_client.post(url).json(&body)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(channel_id, "channel already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl CalendarProvider for GoogleCalendarClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn list_events<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        options: ListOptions,
    ) -> BoxFuture<'a, ProviderResult<EventList>> {
        Box::pin(self.list_events_impl(token, calendar_id, options))
    }

    fn create_event<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        event: &'a ProviderEvent,
        send_updates: SendUpdates,
    ) -> BoxFuture<'a, ProviderResult<ProviderEvent>> {
        Box::pin(async move {
            let request = self
                .http_client
                .post(self.events_url(calendar_id))
                .query(&[("sendUpdates", send_updates.as_str())])
                .json(event);
            Self::parse(self.send(token, request).await?).await
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
            let request = self
                .http_client
                .put(self.event_url(calendar_id, event_id))
                .query(&[("sendUpdates", send_updates.as_str())])
                .json(event);
            Self::parse(self.send(token, request).await?).await
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
            let request = self
                .http_client
                .patch(self.event_url(calendar_id, event_id))
                .query(&[("sendUpdates", send_updates.as_str())])
                .json(patch);
            Self::parse(self.send(token, request).await?).await
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
            let request = self
                .http_client
                .delete(self.event_url(calendar_id, event_id))
                .query(&[("sendUpdates", send_updates.as_str())]);
            self.send(token, request).await.map(|_| ())
        })
    }

    fn list_calendars<'a>(
        &'a self,
        token: &'a AccessToken,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        Box::pin(self.list_calendars_impl(token))
    }

    fn watch_calendar<'a>(
        &'a self,
        token: &'a AccessToken,
        calendar_id: &'a str,
        request: &'a WatchRequest,
    ) -> BoxFuture<'a, ProviderResult<WatchChannel>> {
        Box::pin(self.watch_impl(token, calendar_id, request))
    }

    fn stop_watching<'a>(
        &'a self,
        token: &'a AccessToken,
        channel_id: &'a str,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.stop_impl(token, channel_id, resource_id))
    }

    fn refresh_access_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<RefreshedToken>> {
        Box::pin(async move {
            self.oauth
                .refresh_token(refresh_token)
                .await
                .map_err(|e| e.with_provider(PROVIDER_NAME))
        })
    }
}

/// Reads `Retry-After` as delta-seconds. HTTP-date values are ignored and the
/// computed backoff applies instead.
fn parse_retry_after(response: &Response) -> Option<Duration> {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Channel expirations are milliseconds since the epoch, sent as a string.
fn parse_millis(value: &str) -> Option<DateTime<Utc>> {
    let millis = value.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    #[serde(default)]
    items: Vec<ProviderEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListResponse {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListEntry {
    id: String,
    #[serde(default)]
    summary: String,
    description: Option<String>,
    #[serde(default)]
    primary: bool,
    time_zone: Option<String>,
    access_role: Option<String>,
}

impl From<CalendarListEntry> for CalendarInfo {
    fn from(entry: CalendarListEntry) -> Self {
        let mut info = CalendarInfo::new(entry.id, entry.summary).with_primary(entry.primary);
        info.description = entry.description;
        info.timezone = entry.time_zone;
        info.access_role = entry.access_role;
        info
    }
}

#[derive(Debug, Serialize)]
struct WatchRequestBody<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    address: &'a str,
    params: WatchParams,
}

#[derive(Debug, Serialize)]
struct WatchParams {
    ttl: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    id: String,
    resource_id: String,
    expiration: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::config::OAuthCredentials;
    use hapisync_core::TimeWindow;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token() -> AccessToken {
        AccessToken::new("ya29.test", None)
    }

    fn client(server: &MockServer) -> GoogleCalendarClient {
        let config = GoogleConfig::new(OAuthCredentials::new("id", "secret"))
            .with_api_base_url(server.uri())
            .with_page_size(2)
            .with_max_pages(5);
        GoogleCalendarClient::new(config).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
        )
    }

    fn event_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "summary": format!("event {id}"),
            "start": {"dateTime": "2025-04-02T10:00:00Z"},
            "end": {"dateTime": "2025-04-02T11:00:00Z"}
        })
    }

    #[tokio::test]
    async fn list_events_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [event_json("c")],
                "nextSyncToken": "sync-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(header("authorization", "Bearer ya29.test"))
            .and(query_param("singleEvents", "true"))
            .and(query_param("showDeleted", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [event_json("a"), event_json("b")],
                "nextPageToken": "p2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let options = ListOptions::new()
            .with_time_window(window())
            .with_show_deleted(true);
        let list = client(&server)
            .list_events(&token(), "primary", options)
            .await
            .unwrap();
        let ids: Vec<_> = list.events.iter().filter_map(|e| e.id.as_deref()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(list.next_sync_token.as_deref(), Some("sync-1"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "5")
                    .set_body_string("quota exceeded"),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .list_events(&token(), "primary", ListOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(err.provider(), Some("google"));
    }

    #[tokio::test]
    async fn expired_sync_token_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("syncToken", "old"))
            .respond_with(ResponseTemplate::new(410).set_body_string("gone"))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_events(&token(), "primary", ListOptions::new().with_sync_token("old"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::SyncTokenExpired);
    }

    #[tokio::test]
    async fn missing_calendar_with_sync_token_stays_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("syncToken", "old"))
            .respond_with(ResponseTemplate::new(404).set_body_string("HTTP 410 Gone"))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_events(&token(), "primary", ListOptions::new().with_sync_token("old"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::NotFound);
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn create_sends_tagged_body_without_notifications() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendars/primary/events"))
            .and(query_param("sendUpdates", "none"))
            .and(body_partial_json(serde_json::json!({
                "summary": "Revision",
                "extendedProperties": {"private": {"hapiSync": "true", "hapiSourceId": "s-1"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(event_json("new-1")))
            .expect(1)
            .mount(&server)
            .await;

        let mut event = ProviderEvent {
            summary: Some("Revision".into()),
            ..Default::default()
        };
        event.tag_engine_source(hapisync_core::SourceSystem::StudySession, "s-1");
        let created = client(&server)
            .create_event(&token(), "primary", &event, SendUpdates::None)
            .await
            .unwrap();
        assert_eq!(created.id.as_deref(), Some("new-1"));
    }

    #[tokio::test]
    async fn patch_and_delete_target_event_url() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/calendars/primary/events/evt%231"))
            .and(body_json(serde_json::json!({"location": "Room 2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(event_json("evt#1")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/primary/events/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        let patch = ProviderEvent {
            location: Some("Room 2".into()),
            ..Default::default()
        };
        client
            .patch_event(&token(), "primary", "evt#1", &patch, SendUpdates::None)
            .await
            .unwrap();

        let err = client
            .delete_event(&token(), "primary", "gone", SendUpdates::None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_calendars(&token())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthenticationFailed);
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn expired_token_never_reaches_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let expired = AccessToken::new("old", Some(Utc::now() - chrono::Duration::minutes(1)));
        let err = client(&server)
            .list_events(&expired, "primary", ListOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthExpired);
    }

    #[tokio::test]
    async fn list_calendars_maps_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me/calendarList"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "primary", "summary": "Me", "primary": true, "timeZone": "Europe/Paris", "accessRole": "owner"},
                    {"id": "holidays", "summary": "Holidays", "accessRole": "reader"}
                ]
            })))
            .mount(&server)
            .await;

        let calendars = client(&server).list_calendars(&token()).await.unwrap();
        assert_eq!(calendars.len(), 2);
        assert!(calendars[0].is_primary);
        assert_eq!(calendars[0].timezone.as_deref(), Some("Europe/Paris"));
        assert!(!calendars[1].is_writable());
    }

    #[tokio::test]
    async fn watch_and_stop_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendars/primary/events/watch"))
            .and(body_partial_json(serde_json::json!({
                "id": "chan-1",
                "type": "web_hook",
                "address": "https://hooks.example.com/calendar",
                "params": {"ttl": "604800"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "api#channel",
                "id": "chan-1",
                "resourceId": "res-9",
                "expiration": "1750000000000"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/stop"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        let request = WatchRequest {
            channel_id: "chan-1".into(),
            webhook_url: "https://hooks.example.com/calendar".into(),
            ttl: Duration::from_secs(7 * 24 * 3600),
        };
        let channel = client
            .watch_calendar(&token(), "primary", &request)
            .await
            .unwrap();
        assert_eq!(channel.resource_id, "res-9");
        assert_eq!(
            channel.expiration,
            Utc.timestamp_millis_opt(1_750_000_000_000).single()
        );

        // Stopping an unknown channel is not an error.
        client.stop_watching(&token(), "chan-1", "res-9").await.unwrap();
    }
}
