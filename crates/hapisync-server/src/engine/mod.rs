//! The sync orchestrator.
//!
//! [`SyncEngine`] runs full passes per user (single-flight per user id),
//! incremental passes per connection on push notifications, and the
//! connection lifecycle. Within a user's run, connections are processed one
//! after the other and events of one connection strictly sequentially, so no
//! two writes to the same mapping row are ever in flight.

mod lease;
mod pass;
mod renewal;
mod report;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use hapisync_providers::{CalendarProvider, RetryingProvider, TokenCipher, TokenInfo};
use hapisync_store::{
    CalendarConnection, ConnectionSyncStatus, NewConnection, RunStatus, RunType, Store,
    StoreError, StoreResult, SyncStats, SyncToggles,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{RETRY_LATER_MESSAGE, SyncError, SyncResult};
use crate::locks::KeyedLocks;
use crate::tokens::TokenManager;
use crate::webhook::{IncrementalQueue, WebhookNotification, WebhookOutcome};

use self::lease::HeldLease;
use self::pass::{ConnectionPass, PassOutcome};
use self::report::emit;
pub use self::renewal::RenewalSummary;
pub use self::report::{ConnectionReport, ProgressSink, RunReport};

/// Everything needed to store a newly authorized connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub user_id: String,
    pub account_email: Option<String>,
    pub calendar_id: String,
    pub timezone: Option<String>,
    pub toggles: SyncToggles,
    pub tokens: TokenInfo,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<Store>,
    pub(crate) provider: Arc<dyn CalendarProvider>,
    pub(crate) tokens: TokenManager,
    pub(crate) config: EngineConfig,
    user_locks: KeyedLocks,
    connection_locks: KeyedLocks,
    incremental: IncrementalQueue,
    cancellations: Mutex<HashMap<String, Arc<AtomicBool>>>,
    last_reports: Mutex<HashMap<String, RunReport>>,
    /// Lease holder name of this process.
    instance_id: String,
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("provider", &self.inner.provider.name())
            .field("instance_id", &self.inner.instance_id)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine. The provider is wrapped in the configured retry
    /// policy.
    pub fn new<P>(store: Arc<Store>, provider: P, cipher: TokenCipher, config: EngineConfig) -> Self
    where
        P: CalendarProvider + 'static,
    {
        let provider: Arc<dyn CalendarProvider> =
            Arc::new(RetryingProvider::new(provider, config.retry.clone()));
        let tokens = TokenManager::new(store.clone(), provider.clone(), cipher);
        Self {
            inner: Arc::new(EngineInner {
                store,
                provider,
                tokens,
                config,
                user_locks: KeyedLocks::new(),
                connection_locks: KeyedLocks::new(),
                incremental: IncrementalQueue::default(),
                cancellations: Mutex::new(HashMap::new()),
                last_reports: Mutex::new(HashMap::new()),
                instance_id: Uuid::new_v4().to_string(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Runs datastore work on the blocking pool.
    async fn db<T, F>(&self, work: F) -> SyncResult<T>
    where
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.inner.store.call(work).await?)
    }

    /// Whether a full sync is running for the user in this process.
    pub fn is_syncing(&self, user_id: &str) -> bool {
        self.inner.user_locks.is_locked(user_id)
    }

    /// Runs a full pass over every connection of the user.
    ///
    /// Fails with [`SyncError::AlreadyInProgress`] if a full sync for the
    /// same user is running, here or (with leases enabled) in another
    /// process. Only datastore failures before the run log exists are
    /// returned as errors; everything else ends up in the report.
    ///
    /// With leases enabled the lease is kept alive for the whole run. If it
    /// is lost the run stops before its next write and is marked failed.
    pub async fn perform_full_sync(
        &self,
        user_id: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> SyncResult<RunReport> {
        let Some(_user_guard) = self.inner.user_locks.try_lock(user_id) else {
            debug!(user_id, "full sync already running");
            return Err(SyncError::AlreadyInProgress {
                user_id: user_id.to_string(),
            });
        };
        let lease = self.acquire_lease(user_id).await?;
        let lease_lost = lease.as_ref().map(HeldLease::lost_flag).unwrap_or_default();

        let result = self.run_full(user_id, progress, &lease_lost).await;

        if let Some(lease) = lease {
            lease.release().await;
        }
        if let Ok(report) = &result {
            self.lock_reports().insert(user_id.to_string(), report.clone());
        }
        result
    }

    async fn acquire_lease(&self, user_id: &str) -> SyncResult<Option<HeldLease>> {
        let Some(ttl) = self.inner.config.lease_ttl else {
            return Ok(None);
        };
        let key = format!("user:{user_id}");
        match HeldLease::acquire(self.inner.store.clone(), key, self.inner.instance_id.clone(), ttl).await? {
            Some(lease) => Ok(Some(lease)),
            None => {
                debug!(user_id, "sync lease held by another process");
                Err(SyncError::AlreadyInProgress {
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    async fn run_full(
        &self,
        user_id: &str,
        progress: Option<&dyn ProgressSink>,
        lease_lost: &Arc<AtomicBool>,
    ) -> SyncResult<RunReport> {
        let owner = user_id.to_string();
        let run = self
            .db(move |s| s.start_run(&owner, None, RunType::Full, Utc::now()))
            .await?;
        info!(user_id, run_id = run.id, "full sync started");
        emit(progress, "Starting calendar sync", Some(0));

        let owner = user_id.to_string();
        let connections = match self.db(move |s| s.list_connections_for_user(&owner)).await {
            Ok(connections) => connections,
            Err(err) => {
                error!(user_id, run_id = run.id, error = %err, "failed to load connections");
                let summary = err.user_message();
                self.db(move |s| {
                    s.finish_run(run.id, RunStatus::Failed, &SyncStats::default(), Utc::now(), Some(summary))
                })
                .await?;
                return Err(err);
            }
        };

        let mut stats = SyncStats::default();
        let mut errors = Vec::new();
        let mut reports = Vec::with_capacity(connections.len());

        if connections.is_empty() {
            error!(user_id, run_id = run.id, "no calendar connections");
            errors.push("no calendar connections".to_string());
        }

        let total = connections.len();
        for (index, connection) in connections.iter().enumerate() {
            if lease_lost.load(Ordering::SeqCst) {
                break;
            }
            let percent = u8::try_from(index * 100 / total).unwrap_or(100);
            emit(progress, &format!("Syncing {}", connection.calendar_id), Some(percent));

            let _conn_guard = self.inner.connection_locks.lock(&connection.id).await;
            // Re-read under the lock: the connection may have been removed.
            let id = connection.id.clone();
            let (report, messages) = match self.db(move |s| s.get_connection(&id)).await {
                Ok(Some(current)) => {
                    let outcome = self.run_pass(&current, RunType::Full, lease_lost.clone()).await;
                    if let Err(SyncError::LeaseLost { .. }) = &outcome {
                        break;
                    }
                    self.settle(&current, outcome).await
                }
                Ok(None) => {
                    debug!(connection_id = %connection.id, "connection removed before its pass");
                    continue;
                }
                Err(e) => self.settle(connection, Err(e)).await,
            };
            stats.merge(&report.stats);
            errors.extend(messages);
            reports.push(report);
        }

        let lost = lease_lost.load(Ordering::SeqCst);
        if lost {
            warn!(user_id, run_id = run.id, "sync lease lost, run stopped");
            errors.push("sync lease lost to another process".to_string());
        }

        let aborted = reports
            .iter()
            .filter(|r| r.status == ConnectionSyncStatus::Error)
            .count();
        let status = if lost || reports.is_empty() || aborted == reports.len() {
            RunStatus::Failed
        } else if stats.errors == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        let summary = RunReport::error_summary(&errors);
        let finished = self
            .db(move |s| s.finish_run(run.id, status, &stats, Utc::now(), summary.as_deref()))
            .await?;
        emit(progress, "Calendar sync finished", Some(100));
        info!(
            user_id,
            run_id = run.id,
            status = %status,
            created = stats.events_created,
            updated = stats.events_updated,
            deleted = stats.events_deleted,
            conflicts = stats.conflicts,
            errors = stats.errors,
            "full sync finished"
        );

        Ok(RunReport {
            success: status == RunStatus::Completed,
            errors,
            connections: reports,
            ..RunReport::from_run(&finished)
        })
    }

    async fn run_pass(
        &self,
        connection: &CalendarConnection,
        run_type: RunType,
        lease_lost: Arc<AtomicBool>,
    ) -> SyncResult<PassOutcome> {
        let cancel = self.cancel_flag(&connection.id);
        let pass = ConnectionPass::start(&self.inner, connection, cancel, lease_lost).await?;
        match run_type {
            RunType::Full => pass.full().await,
            RunType::Incremental => pass.incremental().await,
        }
    }

    /// Records the outcome of a connection pass on the connection row.
    ///
    /// Returns the connection report and the messages it contributes to the
    /// run report.
    async fn settle(
        &self,
        connection: &CalendarConnection,
        outcome: SyncResult<PassOutcome>,
    ) -> (ConnectionReport, Vec<String>) {
        let (status, stats, error, messages) = match outcome {
            Ok(outcome) if outcome.stats.errors == 0 => {
                (ConnectionSyncStatus::Success, outcome.stats, None, outcome.errors)
            }
            Ok(outcome) => (
                ConnectionSyncStatus::Partial,
                outcome.stats,
                Some(RETRY_LATER_MESSAGE),
                outcome.errors,
            ),
            Err(err) => {
                warn!(connection_id = %connection.id, error = %err, "connection pass aborted");
                let stats = SyncStats {
                    errors: 1,
                    ..Default::default()
                };
                let message = err.user_message();
                let messages = vec![format!("connection {}: {message}", connection.id)];
                (ConnectionSyncStatus::Error, stats, Some(message), messages)
            }
        };
        let id = connection.id.clone();
        match self
            .inner
            .store
            .call(move |s| s.record_sync_outcome(&id, Utc::now(), status, error))
            .await
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(e) => warn!(connection_id = %connection.id, error = %e, "failed to record sync outcome"),
        }
        let report = ConnectionReport {
            connection_id: connection.id.clone(),
            status,
            stats,
            error: error.map(str::to_string),
        };
        (report, messages)
    }

    /// The report of the user's last full sync, in memory or rebuilt from the
    /// run log.
    pub async fn get_last_sync_status(&self, user_id: &str) -> SyncResult<Option<RunReport>> {
        if let Some(report) = self.lock_reports().get(user_id) {
            return Ok(Some(report.clone()));
        }
        let owner = user_id.to_string();
        Ok(self
            .db(move |s| s.latest_finished_run(&owner, RunType::Full))
            .await?
            .map(|run| RunReport::from_run(&run)))
    }

    /// Entry point for the webhook receiver.
    ///
    /// Unknown channels are discarded. Otherwise an incremental pass runs for
    /// the connection, waiting behind a full pass if one holds it.
    pub async fn handle_webhook(&self, notification: &WebhookNotification) -> SyncResult<WebhookOutcome> {
        let channel_id = notification.channel_id.clone();
        let Some(connection) = self
            .db(move |s| s.find_connection_by_channel(&channel_id))
            .await?
        else {
            info!(channel_id = %notification.channel_id, "notification for unknown channel discarded");
            return Ok(WebhookOutcome::Ignored);
        };
        if let Some(channel) = &connection.channel
            && channel.resource_id != notification.resource_id
        {
            warn!(
                connection_id = %connection.id,
                channel_id = %notification.channel_id,
                "notification resource does not match channel, discarded"
            );
            return Ok(WebhookOutcome::Ignored);
        }
        if notification.is_handshake() {
            debug!(connection_id = %connection.id, "channel handshake received");
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(mut admission) = self.inner.incremental.admit(&connection.id) else {
            debug!(connection_id = %connection.id, "incremental pass already queued");
            return Ok(WebhookOutcome::Coalesced);
        };
        loop {
            let result = self.run_incremental(&connection.id).await;
            if !admission.rerun() {
                return result.map(WebhookOutcome::Processed);
            }
            if let Err(e) = result {
                warn!(connection_id = %connection.id, error = %e, "incremental pass failed");
            }
        }
    }

    /// Runs the external-to-internal half for one connection over the
    /// incremental window or its sync token.
    pub async fn run_incremental(&self, connection_id: &str) -> SyncResult<RunReport> {
        let _conn_guard = self.inner.connection_locks.lock(connection_id).await;
        let id = connection_id.to_string();
        let connection = self
            .db(move |s| s.get_connection(&id))
            .await?
            .ok_or_else(|| SyncError::ConnectionNotFound(connection_id.to_string()))?;

        let (owner, id) = (connection.user_id.clone(), connection.id.clone());
        let run = self
            .db(move |s| s.start_run(&owner, Some(&id), RunType::Incremental, Utc::now()))
            .await?;
        debug!(connection_id, run_id = run.id, "incremental sync started");

        let outcome = self
            .run_pass(&connection, RunType::Incremental, Arc::default())
            .await;
        let (report, errors) = self.settle(&connection, outcome).await;

        let status = match report.status {
            ConnectionSyncStatus::Success => RunStatus::Completed,
            ConnectionSyncStatus::Partial => RunStatus::Partial,
            ConnectionSyncStatus::Error => RunStatus::Failed,
        };
        let summary = RunReport::error_summary(&errors);
        let finished = self
            .db(move |s| s.finish_run(run.id, status, &report.stats, Utc::now(), summary.as_deref()))
            .await?;
        info!(
            connection_id,
            run_id = run.id,
            status = %status,
            imported = report.stats.events_created + report.stats.events_updated,
            "incremental sync finished"
        );
        Ok(RunReport {
            success: status == RunStatus::Completed,
            errors,
            connections: vec![report],
            ..RunReport::from_run(&finished)
        })
    }

    /// Runs a full sync for every user with a connection, one after the other.
    ///
    /// Users already syncing are skipped. Fails only if the user list cannot
    /// be read.
    pub async fn sync_all(&self) -> SyncResult<Vec<RunReport>> {
        let users = self.db(|s| s.list_connected_users()).await?;
        let mut reports = Vec::with_capacity(users.len());
        for user_id in users {
            match self.perform_full_sync(&user_id, None).await {
                Ok(report) => reports.push(report),
                Err(SyncError::AlreadyInProgress { .. }) => {
                    debug!(user_id, "skipping user with a sync in progress");
                }
                Err(e) => warn!(user_id, error = %e, "full sync failed"),
            }
        }
        Ok(reports)
    }

    /// Stores a newly authorized connection and registers its push channel
    /// when a webhook URL is configured.
    ///
    /// Registration goes through the same locked path as renewal, so a sweep
    /// running at the same time leaves exactly one channel.
    pub async fn connect(&self, request: ConnectRequest) -> SyncResult<CalendarConnection> {
        let new = NewConnection {
            user_id: request.user_id,
            provider: self.inner.provider.name().to_string(),
            account_email: request.account_email,
            calendar_id: request.calendar_id,
            timezone: request.timezone,
            toggles: request.toggles,
            encrypted_credentials: self.inner.tokens.seal(&request.tokens)?,
        };
        let connection = self.db(move |s| s.insert_connection(&new)).await?;
        info!(connection_id = %connection.id, user_id = %connection.user_id, "calendar connected");

        if self.inner.config.webhook_url.is_some() {
            let deadline = Utc::now() + self.inner.config.renewal_buffer;
            if let Err(e) = self.renew_channel(&connection.id, deadline).await {
                warn!(connection_id = %connection.id, error = %e, "channel registration failed; renewal will retry");
            }
        }
        let id = connection.id;
        self.db(move |s| s.require_connection(&id)).await
    }

    /// Removes a connection.
    ///
    /// A pass in progress on it stops before its next external write; writes
    /// already in flight complete. The push channel is torn down best-effort
    /// and the connection's mappings go with it. Returns false if the
    /// connection did not exist.
    pub async fn disconnect(&self, connection_id: &str) -> SyncResult<bool> {
        let flag = self.cancel_flag(connection_id);
        flag.store(true, Ordering::SeqCst);

        let result = self.remove_connection(connection_id).await;
        self.lock_cancellations().remove(connection_id);
        result
    }

    async fn remove_connection(&self, connection_id: &str) -> SyncResult<bool> {
        let _conn_guard = self.inner.connection_locks.lock(connection_id).await;
        let id = connection_id.to_string();
        let Some(connection) = self.db(move |s| s.get_connection(&id)).await? else {
            return Ok(false);
        };
        if let Some(channel) = &connection.channel {
            self.stop_channel(&connection, channel).await;
        }
        let id = connection_id.to_string();
        let deleted = self.db(move |s| s.delete_connection(&id)).await?;
        info!(connection_id, user_id = %connection.user_id, "calendar disconnected");
        Ok(deleted)
    }

    fn cancel_flag(&self, connection_id: &str) -> Arc<AtomicBool> {
        self.lock_cancellations()
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    fn lock_cancellations(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.inner
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reports(&self) -> MutexGuard<'_, HashMap<String, RunReport>> {
        self.inner
            .last_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
