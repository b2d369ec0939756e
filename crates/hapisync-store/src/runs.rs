//! Sync run log. A row is opened as `started` and finalized exactly once.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use crate::codec::{get_opt_ts, get_parsed, get_ts, ts};
use crate::error::{StoreError, StoreResult};
use crate::models::{RunStatus, RunType, SyncRun, SyncStats};
use crate::Store;

const COLUMNS: &str = "id, user_id, connection_id, run_type, status,
    events_created, events_updated, events_deleted, conflicts, errors,
    started_at, finished_at, duration_ms, error_summary";

fn from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    Ok(SyncRun {
        id: row.get(0)?,
        user_id: row.get(1)?,
        connection_id: row.get(2)?,
        run_type: get_parsed(row, 3)?,
        status: get_parsed(row, 4)?,
        stats: SyncStats {
            events_created: row.get(5)?,
            events_updated: row.get(6)?,
            events_deleted: row.get(7)?,
            conflicts: row.get(8)?,
            errors: row.get(9)?,
        },
        started_at: get_ts(row, 10)?,
        finished_at: get_opt_ts(row, 11)?,
        duration_ms: row.get(12)?,
        error_summary: row.get(13)?,
    })
}

impl Store {
    /// Opens a run log row in the `started` state.
    pub fn start_run(
        &self,
        user_id: &str,
        connection_id: Option<&str>,
        run_type: RunType,
        started_at: DateTime<Utc>,
    ) -> StoreResult<SyncRun> {
        let id: i64 = {
            let conn = self.conn()?;
            conn.query_row(
                "INSERT INTO sync_runs (user_id, connection_id, run_type, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
                params![
                    user_id,
                    connection_id,
                    run_type.as_str(),
                    RunStatus::Started.as_str(),
                    ts(started_at)
                ],
                |row| row.get(0),
            )?
        };
        self.get_run(id)?
            .ok_or_else(|| StoreError::not_found("sync run", id.to_string()))
    }

    /// Finalizes a run. Fails with [`StoreError::RunFinalized`] if the run was
    /// already finalized; completed rows are immutable.
    pub fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        stats: &SyncStats,
        finished_at: DateTime<Utc>,
        error_summary: Option<&str>,
    ) -> StoreResult<SyncRun> {
        {
            let conn = self.conn()?;
            let started_at: String = match conn.query_row(
                "SELECT started_at FROM sync_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            ) {
                Ok(started_at) => started_at,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(StoreError::not_found("sync run", id.to_string()));
                }
                Err(e) => return Err(StoreError::from(e)),
            };
            let duration_ms = DateTime::parse_from_rfc3339(&started_at)
                .map(|start| (finished_at - start.with_timezone(&Utc)).num_milliseconds().max(0))
                .map_err(|_| StoreError::invalid_value("started_at", started_at.clone()))?;

            let changed = conn.execute(
                "UPDATE sync_runs SET
                    status = ?2, events_created = ?3, events_updated = ?4, events_deleted = ?5,
                    conflicts = ?6, errors = ?7, finished_at = ?8, duration_ms = ?9, error_summary = ?10
                 WHERE id = ?1 AND status = 'started'",
                params![
                    id,
                    status.as_str(),
                    stats.events_created,
                    stats.events_updated,
                    stats.events_deleted,
                    stats.conflicts,
                    stats.errors,
                    ts(finished_at),
                    duration_ms,
                    error_summary,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::RunFinalized(id));
            }
        }
        self.get_run(id)?
            .ok_or_else(|| StoreError::not_found("sync run", id.to_string()))
    }

    pub fn get_run(&self, id: i64) -> StoreResult<Option<SyncRun>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {COLUMNS} FROM sync_runs WHERE id = ?1"),
            params![id],
            from_row,
        );
        match result {
            Ok(run) => Ok(Some(run)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// The most recent finalized run of a type for a user.
    pub fn latest_finished_run(&self, user_id: &str, run_type: RunType) -> StoreResult<Option<SyncRun>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM sync_runs
                 WHERE user_id = ?1 AND run_type = ?2 AND status != 'started'
                 ORDER BY id DESC LIMIT 1"
            ),
            params![user_id, run_type.as_str()],
            from_row,
        );
        match result {
            Ok(run) => Ok(Some(run)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    pub fn list_runs(&self, user_id: &str, limit: u32) -> StoreResult<Vec<SyncRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_runs WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
