//! Push-channel registration and renewal.
//!
//! Every registration happens under the connection lock, after re-reading
//! the connection, so renewal cannot race `connect` into a second channel or
//! `disconnect` into a channel nobody stops.

use chrono::{DateTime, Utc};
use hapisync_providers::WatchRequest;
use hapisync_store::{CalendarConnection, ChannelRegistration};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SyncEngine;
use crate::error::{SyncError, SyncResult};

/// Outcome of one renewal sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub renewed: u32,
    pub failed: u32,
}

impl SyncEngine {
    /// Registers a fresh channel for the connection and stops the one it
    /// replaces. The caller holds the connection lock.
    ///
    /// A channel that cannot be recorded on the connection is stopped again.
    pub(crate) async fn register_channel(
        &self,
        connection: &CalendarConnection,
    ) -> SyncResult<ChannelRegistration> {
        let inner = &self.inner;
        let Some(webhook_url) = inner.config.webhook_url.clone() else {
            return Err(SyncError::config("no webhook URL configured"));
        };
        let token = inner.tokens.access_token(connection).await?;
        let request = WatchRequest {
            channel_id: Uuid::new_v4().to_string(),
            webhook_url,
            ttl: inner.config.channel_ttl,
        };
        let channel = inner
            .provider
            .watch_calendar(&token, &connection.calendar_id, &request)
            .await?;
        let registration = ChannelRegistration {
            channel_id: channel.id,
            resource_id: channel.resource_id,
            expiration: channel.expiration,
        };
        let connection_id = connection.id.clone();
        let recorded = registration.clone();
        if let Err(e) = inner
            .store
            .call(move |s| s.set_channel(&connection_id, Some(&recorded)))
            .await
        {
            warn!(
                connection_id = %connection.id,
                channel_id = %registration.channel_id,
                error = %e,
                "failed to record push channel, stopping it"
            );
            if let Err(stop) = inner
                .provider
                .stop_watching(&token, &registration.channel_id, &registration.resource_id)
                .await
            {
                warn!(connection_id = %connection.id, error = %stop, "failed to stop unrecorded channel");
            }
            return Err(e.into());
        }
        info!(
            connection_id = %connection.id,
            channel_id = %registration.channel_id,
            expiration = ?registration.expiration,
            "push channel registered"
        );

        if let Some(previous) = &connection.channel
            && let Err(e) = inner
                .provider
                .stop_watching(&token, &previous.channel_id, &previous.resource_id)
                .await
        {
            warn!(connection_id = %connection.id, error = %e, "failed to stop replaced channel");
        }
        Ok(registration)
    }

    /// Renews the connection's channel unless it was removed or already given
    /// a channel that outlives `deadline`. Returns whether a channel was
    /// registered.
    pub(crate) async fn renew_channel(&self, connection_id: &str, deadline: DateTime<Utc>) -> SyncResult<bool> {
        let _conn_guard = self.inner.connection_locks.lock(connection_id).await;
        let id = connection_id.to_string();
        let Some(connection) = self.inner.store.call(move |s| s.get_connection(&id)).await? else {
            debug!(connection_id, "connection removed before channel renewal");
            return Ok(false);
        };
        if let Some(channel) = &connection.channel
            && channel.expiration.is_some_and(|expiration| expiration >= deadline)
        {
            debug!(connection_id, channel_id = %channel.channel_id, "push channel is still fresh");
            return Ok(false);
        }
        self.register_channel(&connection).await?;
        Ok(true)
    }

    /// Best-effort teardown of a channel.
    pub(crate) async fn stop_channel(&self, connection: &CalendarConnection, channel: &ChannelRegistration) {
        let token = match self.inner.tokens.access_token(connection).await {
            Ok(token) => token,
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "cannot stop push channel without credentials");
                return;
            }
        };
        match self
            .inner
            .provider
            .stop_watching(&token, &channel.channel_id, &channel.resource_id)
            .await
        {
            Ok(()) => debug!(connection_id = %connection.id, channel_id = %channel.channel_id, "push channel stopped"),
            Err(e) => warn!(connection_id = %connection.id, error = %e, "failed to stop push channel"),
        }
    }

    /// Re-registers channels that expire within the renewal buffer, and
    /// registers one for connections that have none.
    ///
    /// Does nothing without a webhook URL. Failures are counted and retried
    /// on the next sweep.
    pub async fn renew_channels(&self) -> SyncResult<RenewalSummary> {
        let mut summary = RenewalSummary::default();
        if self.inner.config.webhook_url.is_none() {
            return Ok(summary);
        }
        let deadline = Utc::now() + self.inner.config.renewal_buffer;
        let connections = self
            .inner
            .store
            .call(move |s| s.connections_needing_channel(deadline))
            .await?;
        for connection in connections {
            match self.renew_channel(&connection.id, deadline).await {
                Ok(true) => summary.renewed += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(connection_id = %connection.id, error = %e, "channel renewal failed");
                }
            }
        }
        if summary.renewed + summary.failed > 0 {
            info!(renewed = summary.renewed, failed = summary.failed, "channel renewal finished");
        }
        Ok(summary)
    }
}
