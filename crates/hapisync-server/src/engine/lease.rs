//! Per-user sync leases held for the length of a full run.
//!
//! The lease is taken with a TTL and extended by a heartbeat task every third
//! of the TTL. When an extension is refused, or the datastore stays
//! unreachable until the lease would have expired, the lost flag is raised and
//! the run stops before its next write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use hapisync_store::Store;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SyncResult;

const MIN_HEARTBEAT: StdDuration = StdDuration::from_millis(10);

pub(crate) struct HeldLease {
    key: String,
    holder: String,
    store: Arc<Store>,
    lost: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl HeldLease {
    /// Takes the lease on `key`. Returns `None` while another holder owns it.
    pub(crate) async fn acquire(
        store: Arc<Store>,
        key: String,
        holder: String,
        ttl: Duration,
    ) -> SyncResult<Option<Self>> {
        if !try_acquire(&store, &key, &holder, ttl).await? {
            return Ok(None);
        }
        let lost = Arc::new(AtomicBool::new(false));
        let (stop, stopped) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat(
            store.clone(),
            key.clone(),
            holder.clone(),
            ttl,
            lost.clone(),
            stopped,
        ));
        Ok(Some(Self {
            key,
            holder,
            store,
            lost,
            stop: Some(stop),
            heartbeat: Some(heartbeat),
        }))
    }

    /// Raised once the lease can no longer be trusted.
    pub(crate) fn lost_flag(&self) -> Arc<AtomicBool> {
        self.lost.clone()
    }

    /// Stops the heartbeat, then drops the lease if this holder still owns
    /// it. A renewal in flight completes first so it cannot re-create the
    /// row after the release.
    pub(crate) async fn release(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        let key = self.key.clone();
        let holder = self.holder.clone();
        if let Err(e) = self.store.call(move |s| s.release_lease(&key, &holder)).await {
            warn!(key = %self.key, error = %e, "failed to release sync lease");
        }
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

async fn try_acquire(store: &Store, key: &str, holder: &str, ttl: Duration) -> SyncResult<bool> {
    let key = key.to_string();
    let holder = holder.to_string();
    Ok(store
        .call(move |s| s.try_acquire_lease(&key, &holder, ttl, Utc::now()))
        .await?)
}

async fn heartbeat(
    store: Arc<Store>,
    key: String,
    holder: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    mut stopped: oneshot::Receiver<()>,
) {
    let period = (ttl / 3).to_std().unwrap_or(MIN_HEARTBEAT).max(MIN_HEARTBEAT);
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut last_renewed = Utc::now();

    loop {
        tokio::select! {
            _ = &mut stopped => return,
            _ = ticker.tick() => {}
        }
        match try_acquire(&store, &key, &holder, ttl).await {
            Ok(true) => {
                last_renewed = Utc::now();
                debug!(key = %key, "sync lease renewed");
            }
            Ok(false) => {
                warn!(key = %key, "sync lease taken over by another holder");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) if Utc::now() - last_renewed >= ttl => {
                warn!(key = %key, error = %e, "sync lease expired while it could not be renewed");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => warn!(key = %key, error = %e, "failed to renew sync lease"),
        }
    }
}
