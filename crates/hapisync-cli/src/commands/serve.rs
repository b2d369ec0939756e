//! `hapisync serve`: runs the background schedulers in the foreground.
//!
//! Two schedulers share one engine:
//! - periodic full sync of every connected user
//! - push channel renewal (only does work when a webhook URL is configured)
//!
//! SIGHUP runs both jobs immediately; SIGINT and SIGTERM shut down.

use std::time::Duration;

use hapisync_server::{Scheduler, SchedulerHandle, SyncEngine};
use tracing::{info, warn};

use crate::config::HapisyncConfig;
use crate::error::{CliError, CliResult};

/// Blocks until a shutdown signal.
pub async fn run(engine: SyncEngine, config: &HapisyncConfig, initial_sync: bool) -> CliResult<()> {
    let sync_scheduler = Scheduler::new(config.sync_scheduler().with_run_on_start(initial_sync));
    let renewal_scheduler = Scheduler::new(config.renewal_scheduler());
    let sync_handle = sync_scheduler.handle();
    let renewal_handle = renewal_scheduler.handle();

    let sync_engine = engine.clone();
    let sync_task = tokio::spawn(async move {
        sync_scheduler
            .run(move || {
                let engine = sync_engine.clone();
                async move { sync_all(&engine).await }
            })
            .await;
    });

    let renewal_engine = engine.clone();
    let renewal_task = tokio::spawn(async move {
        renewal_scheduler
            .run(move || {
                let engine = renewal_engine.clone();
                async move {
                    let summary = engine.renew_channels().await.map_err(|e| e.to_string())?;
                    if summary.failed > 0 {
                        return Err(format!("{} channel renewals failed", summary.failed));
                    }
                    Ok::<(), String>(())
                }
            })
            .await;
    });

    info!(
        interval_secs = config.sync.interval_secs,
        webhook = config.sync.webhook_url.is_some(),
        "hapisync daemon started"
    );

    wait_for_shutdown(&[&sync_handle, &renewal_handle]).await?;

    info!("Shutting down...");
    for handle in [&sync_handle, &renewal_handle] {
        if let Err(e) = handle.stop().await {
            warn!(error = %e, "Failed to send stop command to scheduler");
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(10), sync_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), renewal_task).await;

    info!("hapisync daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(handles: &[&SchedulerHandle]) -> CliResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listen = |kind: SignalKind| {
        signal(kind).map_err(|e| CliError::config(format!("failed to install signal handler: {e}")))
    };
    let mut sigterm = listen(SignalKind::terminate())?;
    let mut sigint = listen(SignalKind::interrupt())?;
    let mut sighup = listen(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, running sync and renewal now");
                for handle in handles {
                    if let Err(e) = handle.run_now().await {
                        warn!(error = %e, "Failed to send run command to scheduler");
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handles: &[&SchedulerHandle]) -> CliResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CliError::config(format!("failed to listen for ctrl-c: {e}")))
}

/// One scheduler tick. A user already syncing is not a failure; anything
/// else that stops a user's run is.
async fn sync_all(engine: &SyncEngine) -> Result<(), String> {
    let reports = engine.sync_all().await.map_err(|e| e.to_string())?;
    let failed = reports.iter().filter(|r| !r.success).count();
    info!(users = reports.len(), failed, "scheduled sync finished");
    if failed > 0 && failed == reports.len() {
        return Err(format!("sync failed for all {failed} users"));
    }
    Ok(())
}
