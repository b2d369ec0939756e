//! Event mapping rows.
//!
//! Keyed by `(user, connection, source_system, source_id)`; the unique
//! constraint guarantees one row per internal event, and upserts go through
//! `ON CONFLICT` so concurrent writers cannot create a second row.

use chrono::Utc;
use rusqlite::{Row, params};

use hapisync_core::{ContentHash, SourceSystem};

use crate::codec::{get_opt_parsed, get_opt_ts, get_parsed, opt_ts, ts};
use crate::error::{StoreError, StoreResult};
use crate::models::{EventMapping, MappingStatus};
use crate::Store;

const COLUMNS: &str = "id, user_id, connection_id, source_system, source_id, external_event_id,
    hapi_version_hash, external_version_hash, sync_status, last_modified_by,
    hapi_deleted, external_deleted, hapi_snapshot, external_snapshot, last_error, last_synced_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<EventMapping> {
    let hapi_hash: Option<String> = row.get(6)?;
    let external_hash: Option<String> = row.get(7)?;
    Ok(EventMapping {
        id: row.get(0)?,
        user_id: row.get(1)?,
        connection_id: row.get(2)?,
        source_system: get_parsed(row, 3)?,
        source_id: row.get(4)?,
        external_event_id: row.get(5)?,
        hapi_version_hash: hapi_hash.map(ContentHash::from_stored),
        external_version_hash: external_hash.map(ContentHash::from_stored),
        sync_status: get_parsed(row, 8)?,
        last_modified_by: get_opt_parsed(row, 9)?,
        hapi_deleted: row.get(10)?,
        external_deleted: row.get(11)?,
        hapi_snapshot: row.get(12)?,
        external_snapshot: row.get(13)?,
        last_error: row.get(14)?,
        last_synced_at: get_opt_ts(row, 15)?,
    })
}

impl Store {
    /// Looks up the mapping of an internal event.
    pub fn find_mapping(
        &self,
        user_id: &str,
        connection_id: &str,
        source_system: SourceSystem,
        source_id: &str,
    ) -> StoreResult<Option<EventMapping>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM event_mappings
                 WHERE user_id = ?1 AND connection_id = ?2 AND source_system = ?3 AND source_id = ?4"
            ),
            params![user_id, connection_id, source_system.as_str(), source_id],
            from_row,
        );
        match result {
            Ok(mapping) => Ok(Some(mapping)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// Looks up the mapping pointing at an external event.
    pub fn find_mapping_by_external(
        &self,
        connection_id: &str,
        external_event_id: &str,
    ) -> StoreResult<Option<EventMapping>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM event_mappings
                 WHERE connection_id = ?1 AND external_event_id = ?2
                 ORDER BY id LIMIT 1"
            ),
            params![connection_id, external_event_id],
            from_row,
        );
        match result {
            Ok(mapping) => Ok(Some(mapping)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    pub fn list_mappings(&self, connection_id: &str) -> StoreResult<Vec<EventMapping>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM event_mappings WHERE connection_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![connection_id], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Inserts or updates a mapping in one statement and returns its row id.
    pub fn upsert_mapping(&self, mapping: &EventMapping) -> StoreResult<i64> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO event_mappings (
                user_id, connection_id, source_system, source_id, external_event_id,
                hapi_version_hash, external_version_hash, sync_status, last_modified_by,
                hapi_deleted, external_deleted, hapi_snapshot, external_snapshot,
                last_error, last_synced_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(user_id, connection_id, source_system, source_id) DO UPDATE SET
                external_event_id = excluded.external_event_id,
                hapi_version_hash = excluded.hapi_version_hash,
                external_version_hash = excluded.external_version_hash,
                sync_status = excluded.sync_status,
                last_modified_by = excluded.last_modified_by,
                hapi_deleted = excluded.hapi_deleted,
                external_deleted = excluded.external_deleted,
                hapi_snapshot = excluded.hapi_snapshot,
                external_snapshot = excluded.external_snapshot,
                last_error = excluded.last_error,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            RETURNING id",
            params![
                mapping.user_id,
                mapping.connection_id,
                mapping.source_system.as_str(),
                mapping.source_id,
                mapping.external_event_id,
                mapping.hapi_version_hash.as_ref().map(ContentHash::as_str),
                mapping.external_version_hash.as_ref().map(ContentHash::as_str),
                mapping.sync_status.as_str(),
                mapping.last_modified_by.map(|m| m.as_str()),
                mapping.hapi_deleted,
                mapping.external_deleted,
                mapping.hapi_snapshot,
                mapping.external_snapshot,
                mapping.last_error,
                opt_ts(mapping.last_synced_at),
                ts(Utc::now()),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Sets the status of a mapping, keeping its hashes.
    pub fn set_mapping_status(
        &self,
        id: i64,
        status: MappingStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE event_mappings SET sync_status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), error, ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("mapping", id.to_string()));
        }
        Ok(())
    }

    pub fn count_mappings(&self, connection_id: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM event_mappings WHERE connection_id = ?1",
            params![connection_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
