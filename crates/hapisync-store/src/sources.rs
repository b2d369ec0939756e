//! Source-event tables: LMS events, study sessions and imported external
//! events.
//!
//! LMS rows are written by the LMS import subsystem; [`Store::upsert_lms_event`]
//! exists for that subsystem and for tests. The engine reads LMS rows only.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use hapisync_core::transform::{from_snapshot, to_snapshot};
use hapisync_core::{
    CanonicalEvent, ContentHash, LmsEvent, SourceSystem, StudySession, TimeWindow, WriteOperation,
    ensure_writable,
};

use crate::codec::{event_time, get_event_time, get_opt_event_time, get_ts, span, ts};
use crate::error::{StoreError, StoreResult};
use crate::models::ImportedEvent;
use crate::Store;

fn lms_from_row(row: &Row<'_>) -> rusqlite::Result<LmsEvent> {
    let all_day: bool = row.get(8)?;
    Ok(LmsEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        course_code: row.get(4)?,
        location: row.get(5)?,
        start: get_event_time(row, 6, all_day)?,
        end: get_opt_event_time(row, 7, all_day)?,
        deleted: row.get(9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<StudySession> {
    let all_day: bool = row.get(7)?;
    Ok(StudySession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        notes: row.get(3)?,
        location: row.get(4)?,
        start: get_event_time(row, 5, all_day)?,
        end: get_opt_event_time(row, 6, all_day)?,
        deleted: row.get(8)?,
        updated_at: get_ts(row, 9)?,
    })
}

impl Store {
    pub fn upsert_lms_event(&self, event: &LmsEvent) -> StoreResult<()> {
        let (start, all_day) = event_time(&event.start);
        let end = event.end.as_ref().map(|t| event_time(t).0);
        let (span_start, span_end) = span(&event.start, event.end.as_ref());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lms_events (
                id, user_id, title, description, course_code, location,
                start_at, end_at, all_day, deleted, updated_at, span_start, span_end
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                course_code = excluded.course_code,
                location = excluded.location,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                all_day = excluded.all_day,
                span_start = excluded.span_start,
                span_end = excluded.span_end,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            params![
                event.id,
                event.user_id,
                event.title,
                event.description,
                event.course_code,
                event.location,
                start,
                end,
                all_day,
                event.deleted,
                ts(event.updated_at),
                span_start,
                span_end,
            ],
        )?;
        Ok(())
    }

    /// LMS events of a user overlapping `window`. Tombstones are returned
    /// whatever their dates so mirrored copies can be removed.
    pub fn list_lms_events(&self, user_id: &str, window: &TimeWindow) -> StoreResult<Vec<LmsEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, description, course_code, location,
                    start_at, end_at, all_day, deleted, updated_at
             FROM lms_events
             WHERE user_id = ?1 AND (deleted = 1 OR (span_start < ?2 AND span_end > ?3))
             ORDER BY span_start, id",
        )?;
        let rows = stmt.query_map(params![user_id, ts(window.end), ts(window.start)], lms_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_lms_event(&self, id: &str) -> StoreResult<Option<LmsEvent>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT id, user_id, title, description, course_code, location,
                    start_at, end_at, all_day, deleted, updated_at
             FROM lms_events WHERE id = ?1",
            params![id],
            lms_from_row,
        );
        match result {
            Ok(event) => Ok(Some(event)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    pub fn upsert_study_session(&self, session: &StudySession) -> StoreResult<()> {
        let (start, all_day) = event_time(&session.start);
        let end = session.end.as_ref().map(|t| event_time(t).0);
        let (span_start, span_end) = span(&session.start, session.end.as_ref());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO study_sessions (
                id, user_id, title, notes, location, start_at, end_at, all_day, deleted, updated_at,
                span_start, span_end
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                notes = excluded.notes,
                location = excluded.location,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                all_day = excluded.all_day,
                span_start = excluded.span_start,
                span_end = excluded.span_end,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            params![
                session.id,
                session.user_id,
                session.title,
                session.notes,
                session.location,
                start,
                end,
                all_day,
                session.deleted,
                ts(session.updated_at),
                span_start,
                span_end,
            ],
        )?;
        Ok(())
    }

    /// Study sessions of a user overlapping `window`, plus tombstones.
    pub fn list_study_sessions(&self, user_id: &str, window: &TimeWindow) -> StoreResult<Vec<StudySession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, notes, location, start_at, end_at, all_day, deleted, updated_at
             FROM study_sessions
             WHERE user_id = ?1 AND (deleted = 1 OR (span_start < ?2 AND span_end > ?3))
             ORDER BY span_start, id",
        )?;
        let rows = stmt.query_map(params![user_id, ts(window.end), ts(window.start)], session_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_study_session(&self, id: &str) -> StoreResult<Option<StudySession>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT id, user_id, title, notes, location, start_at, end_at, all_day, deleted, updated_at
             FROM study_sessions WHERE id = ?1",
            params![id],
            session_from_row,
        );
        match result {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// Applies an external edit to a study session, restoring it if it was
    /// soft-deleted.
    pub fn apply_external_edit(
        &self,
        source_system: SourceSystem,
        source_id: &str,
        event: &CanonicalEvent,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        ensure_writable(source_system, WriteOperation::Update)
            .map_err(|e| StoreError::invalid_value("source_system", e.to_string()))?;
        let mut session = self
            .get_study_session(source_id)?
            .ok_or_else(|| StoreError::not_found("study session", source_id))?;
        session.title = event.title.clone();
        session.notes = event.description.clone();
        session.location = event.location.clone();
        session.start = event.start;
        session.end = Some(event.end);
        session.deleted = false;
        session.updated_at = at;
        self.upsert_study_session(&session)
    }

    /// Soft-deletes a study session after an external deletion.
    pub fn apply_external_delete(
        &self,
        source_system: SourceSystem,
        source_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        ensure_writable(source_system, WriteOperation::Delete)
            .map_err(|e| StoreError::invalid_value("source_system", e.to_string()))?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE study_sessions SET deleted = 1, updated_at = ?2 WHERE id = ?1",
            params![source_id, ts(at)],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("study session", source_id));
        }
        Ok(())
    }

    /// Inserts or refreshes an external event copied into the internal store.
    pub fn upsert_imported_event(&self, imported: &ImportedEvent) -> StoreResult<()> {
        let snapshot = to_snapshot(&imported.event)
            .map_err(|e| StoreError::invalid_value("event", e.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO imported_events (
                connection_id, external_event_id, user_id, event, content_hash, deleted, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(connection_id, external_event_id) DO UPDATE SET
                event = excluded.event,
                content_hash = excluded.content_hash,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            params![
                imported.connection_id,
                imported.external_event_id,
                imported.user_id,
                snapshot,
                imported.content_hash.as_str(),
                imported.deleted,
                ts(imported.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_imported_event(
        &self,
        connection_id: &str,
        external_event_id: &str,
    ) -> StoreResult<Option<ImportedEvent>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT connection_id, external_event_id, user_id, event, content_hash, deleted, updated_at
             FROM imported_events WHERE connection_id = ?1 AND external_event_id = ?2",
            params![connection_id, external_event_id],
            imported_columns,
        );
        match result {
            Ok(columns) => Ok(Some(columns.into_imported()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    pub fn list_imported_events(&self, connection_id: &str) -> StoreResult<Vec<ImportedEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT connection_id, external_event_id, user_id, event, content_hash, deleted, updated_at
             FROM imported_events WHERE connection_id = ?1 ORDER BY external_event_id",
        )?;
        let rows = stmt.query_map(params![connection_id], imported_columns)?;
        let mut events = Vec::new();
        for columns in rows {
            events.push(columns?.into_imported()?);
        }
        Ok(events)
    }

    /// Flags an imported event as deleted. Returns false if it was never imported.
    pub fn mark_imported_deleted(
        &self,
        connection_id: &str,
        external_event_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE imported_events SET deleted = 1, updated_at = ?3
             WHERE connection_id = ?1 AND external_event_id = ?2 AND deleted = 0",
            params![connection_id, external_event_id, ts(at)],
        )?;
        Ok(changed > 0)
    }
}

/// Raw imported-event columns; the snapshot is decoded outside the row closure.
struct ImportedColumns {
    connection_id: String,
    external_event_id: String,
    user_id: String,
    snapshot: String,
    content_hash: String,
    deleted: bool,
    updated_at: DateTime<Utc>,
}

fn imported_columns(row: &Row<'_>) -> rusqlite::Result<ImportedColumns> {
    Ok(ImportedColumns {
        connection_id: row.get(0)?,
        external_event_id: row.get(1)?,
        user_id: row.get(2)?,
        snapshot: row.get(3)?,
        content_hash: row.get(4)?,
        deleted: row.get(5)?,
        updated_at: get_ts(row, 6)?,
    })
}

impl ImportedColumns {
    fn into_imported(self) -> StoreResult<ImportedEvent> {
        let event = from_snapshot(&self.snapshot)
            .map_err(|e| StoreError::invalid_value("event", e.to_string()))?;
        Ok(ImportedEvent {
            connection_id: self.connection_id,
            external_event_id: self.external_event_id,
            user_id: self.user_id,
            event,
            content_hash: ContentHash::from_stored(self.content_hash),
            deleted: self.deleted,
            updated_at: self.updated_at,
        })
    }
}
