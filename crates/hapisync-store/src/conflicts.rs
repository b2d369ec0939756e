//! Sync conflict rows.

use chrono::Utc;
use rusqlite::{Row, params};
use tracing::info;

use crate::codec::{get_opt_parsed, get_opt_ts, get_parsed, get_ts, ts};
use crate::error::{StoreError, StoreResult};
use crate::models::{MappingStatus, NewConflict, ResolutionAction, ResolutionStatus, SyncConflict};
use crate::Store;

const SELECT: &str = "SELECT c.id, c.mapping_id, m.user_id, m.connection_id, c.conflict_type,
        c.hapi_snapshot, c.external_snapshot, c.resolution_status, c.resolution_action,
        c.detected_at, c.resolved_at
    FROM sync_conflicts c JOIN event_mappings m ON m.id = c.mapping_id";

fn from_row(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    Ok(SyncConflict {
        id: row.get(0)?,
        mapping_id: row.get(1)?,
        user_id: row.get(2)?,
        connection_id: row.get(3)?,
        conflict_type: get_parsed(row, 4)?,
        hapi_snapshot: row.get(5)?,
        external_snapshot: row.get(6)?,
        status: get_parsed(row, 7)?,
        resolution_action: get_opt_parsed(row, 8)?,
        detected_at: get_ts(row, 9)?,
        resolved_at: get_opt_ts(row, 10)?,
    })
}

impl Store {
    pub fn record_conflict(&self, conflict: &NewConflict) -> StoreResult<i64> {
        let now = ts(Utc::now());
        let resolved_at = (conflict.status != ResolutionStatus::Pending).then(|| now.clone());
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO sync_conflicts (
                mapping_id, conflict_type, hapi_snapshot, external_snapshot,
                resolution_status, resolution_action, detected_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) RETURNING id",
            params![
                conflict.mapping_id,
                conflict.conflict_type.as_str(),
                conflict.hapi_snapshot,
                conflict.external_snapshot,
                conflict.status.as_str(),
                conflict.resolution_action.map(|a| a.as_str()),
                now,
                resolved_at,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// The unresolved conflict on a mapping, if any.
    pub fn pending_conflict_for_mapping(&self, mapping_id: i64) -> StoreResult<Option<SyncConflict>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("{SELECT} WHERE c.mapping_id = ?1 AND c.resolution_status = 'pending' ORDER BY c.id LIMIT 1"),
            params![mapping_id],
            from_row,
        );
        match result {
            Ok(conflict) => Ok(Some(conflict)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// The most recently detected conflict on a mapping, whatever its status.
    pub fn latest_conflict_for_mapping(&self, mapping_id: i64) -> StoreResult<Option<SyncConflict>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("{SELECT} WHERE c.mapping_id = ?1 ORDER BY c.id DESC LIMIT 1"),
            params![mapping_id],
            from_row,
        );
        match result {
            Ok(conflict) => Ok(Some(conflict)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// Conflicts of a user, optionally filtered by resolution status.
    pub fn list_conflicts(
        &self,
        user_id: &str,
        status: Option<ResolutionStatus>,
    ) -> StoreResult<Vec<SyncConflict>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT} WHERE m.user_id = ?1 AND (?2 IS NULL OR c.resolution_status = ?2) ORDER BY c.id"
        ))?;
        let rows = stmt.query_map(params![user_id, status.map(|s| s.as_str())], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Records a decision on a conflict.
    ///
    /// A mapping held in `conflict` goes back to `pending`, so the next pass
    /// synchronises it again from the current state of both sides.
    pub fn resolve_conflict(
        &self,
        id: i64,
        status: ResolutionStatus,
        action: Option<ResolutionAction>,
    ) -> StoreResult<()> {
        if status == ResolutionStatus::Pending {
            return Err(StoreError::invalid_value("resolution_status", status.as_str()));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mapping_id: i64 = match tx.query_row(
            "UPDATE sync_conflicts SET resolution_status = ?2, resolution_action = ?3, resolved_at = ?4
             WHERE id = ?1 RETURNING mapping_id",
            params![id, status.as_str(), action.map(|a| a.as_str()), ts(Utc::now())],
            |row| row.get(0),
        ) {
            Ok(mapping_id) => mapping_id,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::not_found("conflict", id.to_string()));
            }
            Err(e) => return Err(StoreError::from(e)),
        };
        tx.execute(
            "UPDATE event_mappings SET sync_status = ?2, updated_at = ?3
             WHERE id = ?1 AND sync_status = ?4
               AND NOT EXISTS (
                   SELECT 1 FROM sync_conflicts
                   WHERE mapping_id = ?1 AND resolution_status = 'pending'
               )",
            params![
                mapping_id,
                MappingStatus::Pending.as_str(),
                ts(Utc::now()),
                MappingStatus::Conflict.as_str()
            ],
        )?;
        tx.commit()?;
        info!(conflict_id = id, mapping_id, status = %status, "conflict resolved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventMapping;
    use crate::test_support::{connection, store};
    use hapisync_core::{ConflictType, SourceSystem};

    fn conflicted_mapping(store: &Store) -> i64 {
        let c = connection(store, "u-1");
        let mut mapping = EventMapping::new("u-1", &c.id, SourceSystem::StudySession, "s-1");
        mapping.external_event_id = Some("g-1".into());
        mapping.sync_status = MappingStatus::Conflict;
        store.upsert_mapping(&mapping).unwrap()
    }

    fn pending(mapping_id: i64) -> NewConflict {
        NewConflict {
            mapping_id,
            conflict_type: ConflictType::TimeChange,
            hapi_snapshot: Some("{}".into()),
            external_snapshot: Some("{}".into()),
            status: ResolutionStatus::Pending,
            resolution_action: None,
        }
    }

    #[test]
    fn record_and_resolve() {
        let store = store();
        let mapping_id = conflicted_mapping(&store);
        let id = store.record_conflict(&pending(mapping_id)).unwrap();

        let open = store.pending_conflict_for_mapping(mapping_id).unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.user_id, "u-1");
        assert_eq!(open.conflict_type, ConflictType::TimeChange);
        assert!(open.resolved_at.is_none());

        store
            .resolve_conflict(id, ResolutionStatus::Resolved, Some(ResolutionAction::KeptExternal))
            .unwrap();
        assert!(store.pending_conflict_for_mapping(mapping_id).unwrap().is_none());
        let latest = store.latest_conflict_for_mapping(mapping_id).unwrap().unwrap();
        assert_eq!(latest.status, ResolutionStatus::Resolved);

        let resolved = store
            .list_conflicts("u-1", Some(ResolutionStatus::Resolved))
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolution_action, Some(ResolutionAction::KeptExternal));
        assert!(resolved[0].resolved_at.is_some());

        let mapping = store.list_mappings(&resolved[0].connection_id).unwrap().remove(0);
        assert_eq!(mapping.sync_status, MappingStatus::Pending);
    }

    #[test]
    fn auto_resolved_conflicts_are_closed_on_insert() {
        let store = store();
        let mapping_id = conflicted_mapping(&store);
        store
            .record_conflict(&NewConflict {
                status: ResolutionStatus::AutoResolved,
                resolution_action: Some(ResolutionAction::KeptSource),
                ..pending(mapping_id)
            })
            .unwrap();
        assert!(store.pending_conflict_for_mapping(mapping_id).unwrap().is_none());
        assert_eq!(store.list_conflicts("u-1", None).unwrap().len(), 1);
    }

    #[test]
    fn resolve_rejects_pending_and_unknown() {
        let store = store();
        assert!(matches!(
            store.resolve_conflict(1, ResolutionStatus::Pending, None),
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.resolve_conflict(42, ResolutionStatus::Ignored, None),
            Err(StoreError::NotFound { .. })
        ));
    }
}
