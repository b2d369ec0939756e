//! Run reports and progress reporting.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use hapisync_store::{ConnectionSyncStatus, RunStatus, RunType, SyncRun, SyncStats};
use serde::Serialize;
use tracing::debug;

/// Outcome of one connection within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub connection_id: String,
    pub status: ConnectionSyncStatus,
    pub stats: SyncStats,
    /// User-facing message when the connection did not fully succeed.
    pub error: Option<String>,
}

/// Summary of a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub user_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    /// True iff the run recorded no errors.
    pub success: bool,
    pub stats: SyncStats,
    pub errors: Vec<String>,
    pub connections: Vec<ConnectionReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl RunReport {
    /// Rebuilds a report from a persisted run log row.
    ///
    /// Per-connection outcomes and individual messages are not persisted;
    /// the error summary becomes the only message.
    pub fn from_run(run: &SyncRun) -> Self {
        Self {
            run_id: run.id,
            user_id: run.user_id.clone(),
            run_type: run.run_type,
            status: run.status,
            success: run.stats.errors == 0 && run.status == RunStatus::Completed,
            stats: run.stats,
            errors: run.error_summary.iter().cloned().collect(),
            connections: Vec::new(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms,
        }
    }

    /// Joined error messages for the run log, if any.
    pub fn error_summary(errors: &[String]) -> Option<String> {
        const MAX_LISTED: usize = 5;
        if errors.is_empty() {
            return None;
        }
        let mut summary = errors
            .iter()
            .take(MAX_LISTED)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if errors.len() > MAX_LISTED {
            summary.push_str(&format!(" (+{} more)", errors.len() - MAX_LISTED));
        }
        Some(summary)
    }
}

/// Receives progress updates during a full sync.
///
/// Calls are fire-and-forget: a panicking sink is ignored and never fails
/// the run.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str, percent: Option<u8>);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, Option<u8>) + Send + Sync,
{
    fn report(&self, message: &str, percent: Option<u8>) {
        self(message, percent)
    }
}

pub(crate) fn emit(sink: Option<&dyn ProgressSink>, message: &str, percent: Option<u8>) {
    let Some(sink) = sink else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| sink.report(message, percent))).is_err() {
        debug!(message, "progress sink panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |message: &str, percent: Option<u8>| {
            seen.lock().unwrap().push((message.to_string(), percent));
        };
        emit(Some(&sink), "starting", Some(0));
        emit(None, "ignored", None);
        assert_eq!(seen.into_inner().unwrap(), vec![("starting".to_string(), Some(0))]);
    }

    fn panicking_sink(_: &str, _: Option<u8>) {
        panic!("ui went away");
    }

    #[test]
    fn panicking_sink_is_ignored() {
        emit(Some(&panicking_sink), "starting", None);
    }

    #[test]
    fn error_summary_is_bounded() {
        assert_eq!(RunReport::error_summary(&[]), None);
        let errors: Vec<String> = (1..=7).map(|i| format!("e{i}")).collect();
        assert_eq!(
            RunReport::error_summary(&errors).unwrap(),
            "e1; e2; e3; e4; e5 (+2 more)"
        );
    }

    #[test]
    fn report_from_run_row() {
        let run = SyncRun {
            id: 7,
            user_id: "u-1".into(),
            connection_id: None,
            run_type: RunType::Full,
            status: RunStatus::Partial,
            stats: SyncStats {
                events_created: 2,
                errors: 1,
                ..Default::default()
            },
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            duration_ms: Some(12),
            error_summary: Some("lms lms-3: service_unavailable".into()),
        };
        let report = RunReport::from_run(&run);
        assert!(!report.success);
        assert_eq!(report.errors, vec!["lms lms-3: service_unavailable"]);
        assert_eq!(report.stats.events_created, 2);
    }
}
