//! One-shot engine commands: `sync`, `status` and `disconnect`.

use std::fmt::Write as _;

use hapisync_server::{RunReport, SyncEngine};

use crate::error::{CliError, CliResult};

/// Runs a full sync for one user, printing progress to stderr.
pub async fn sync(engine: &SyncEngine, user_id: &str, json: bool) -> CliResult<()> {
    let progress = |message: &str, percent: Option<u8>| match percent {
        Some(percent) => eprintln!("[{percent:>3}%] {message}"),
        None => eprintln!("       {message}"),
    };
    let report = engine.perform_full_sync(user_id, Some(&progress)).await?;
    print_report(&report, json)
}

pub async fn status(engine: &SyncEngine, user_id: &str, json: bool) -> CliResult<()> {
    match engine.get_last_sync_status(user_id).await? {
        Some(report) => print_report(&report, json),
        None => {
            println!("No sync has run for {user_id} yet.");
            Ok(())
        }
    }
}

pub async fn disconnect(engine: &SyncEngine, connection_id: &str) -> CliResult<()> {
    if engine.disconnect(connection_id).await? {
        println!("Disconnected {connection_id}.");
    } else {
        println!("No connection {connection_id}.");
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> CliResult<()> {
    if json {
        let out = serde_json::to_string_pretty(report)
            .map_err(|e| CliError::config(format!("failed to serialize report: {e}")))?;
        println!("{out}");
    } else {
        print!("{}", render_report(report));
    }
    Ok(())
}

/// Plain-text rendering of a run report.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let stats = &report.stats;
    let _ = writeln!(
        out,
        "{} sync #{} for {}: {}",
        report.run_type, report.run_id, report.user_id, report.status
    );
    let _ = writeln!(
        out,
        "  created {}, updated {}, deleted {}, conflicts {}, errors {}",
        stats.events_created, stats.events_updated, stats.events_deleted, stats.conflicts, stats.errors
    );
    if let Some(ms) = report.duration_ms {
        let _ = writeln!(out, "  took {ms} ms");
    }
    for connection in &report.connections {
        let _ = write!(out, "  {}: {}", connection.connection_id, connection.status);
        if let Some(error) = &connection.error {
            let _ = write!(out, " ({error})");
        }
        out.push('\n');
    }
    for error in &report.errors {
        let _ = writeln!(out, "  ! {error}");
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hapisync_server::ConnectionReport;
    use hapisync_store::{ConnectionSyncStatus, RunStatus, RunType, SyncStats};

    use super::*;

    #[test]
    fn report_lists_connections_and_errors() {
        let report = RunReport {
            run_id: 7,
            user_id: "u-1".into(),
            run_type: RunType::Full,
            status: RunStatus::Partial,
            success: false,
            stats: SyncStats {
                events_created: 2,
                errors: 1,
                ..Default::default()
            },
            errors: vec!["lms lms-2: service_unavailable".into()],
            connections: vec![ConnectionReport {
                connection_id: "conn-1".into(),
                status: ConnectionSyncStatus::Partial,
                stats: SyncStats::default(),
                error: Some("Calendar sync failed. It will be retried later.".into()),
            }],
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: Some(42),
        };
        let text = render_report(&report);
        assert!(text.starts_with("full sync #7 for u-1: partial\n"));
        assert!(text.contains("created 2, updated 0, deleted 0, conflicts 0, errors 1"));
        assert!(text.contains("  conn-1: partial (Calendar sync failed."));
        assert!(text.contains("  ! lms lms-2: service_unavailable"));
    }
}
