//! Connection rows: one per (user, external account, calendar).

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use tracing::debug;
use uuid::Uuid;

use crate::codec::{get_opt_parsed, get_opt_ts, get_ts, opt_ts, ts};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CalendarConnection, ChannelRegistration, ConnectionSyncStatus, NewConnection, SyncToggles,
};
use crate::Store;

const COLUMNS: &str = "id, user_id, provider, account_email, calendar_id, timezone,
    sync_lms_events, sync_study_sessions, sync_external_events, encrypted_credentials,
    last_sync_at, last_sync_status, last_sync_error,
    channel_id, channel_resource_id, channel_expiration, sync_token, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<CalendarConnection> {
    let channel_id: Option<String> = row.get(13)?;
    let channel_resource_id: Option<String> = row.get(14)?;
    let channel = match (channel_id, channel_resource_id) {
        (Some(channel_id), Some(resource_id)) => Some(ChannelRegistration {
            channel_id,
            resource_id,
            expiration: get_opt_ts(row, 15)?,
        }),
        _ => None,
    };

    Ok(CalendarConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        account_email: row.get(3)?,
        calendar_id: row.get(4)?,
        timezone: row.get(5)?,
        toggles: SyncToggles {
            lms_events: row.get(6)?,
            study_sessions: row.get(7)?,
            external_events: row.get(8)?,
        },
        encrypted_credentials: row.get(9)?,
        last_sync_at: get_opt_ts(row, 10)?,
        last_sync_status: get_opt_parsed(row, 11)?,
        last_sync_error: row.get(12)?,
        channel,
        sync_token: row.get(16)?,
        created_at: get_ts(row, 17)?,
        updated_at: get_ts(row, 18)?,
    })
}

impl Store {
    pub fn insert_connection(&self, new: &NewConnection) -> StoreResult<CalendarConnection> {
        let id = Uuid::new_v4().to_string();
        let now = ts(Utc::now());
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO calendar_connections (
                    id, user_id, provider, account_email, calendar_id, timezone,
                    sync_lms_events, sync_study_sessions, sync_external_events,
                    encrypted_credentials, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id,
                    new.user_id,
                    new.provider,
                    new.account_email,
                    new.calendar_id,
                    new.timezone,
                    new.toggles.lms_events,
                    new.toggles.study_sessions,
                    new.toggles.external_events,
                    new.encrypted_credentials,
                    now,
                ],
            )?;
        }
        debug!(connection_id = %id, user_id = %new.user_id, "inserted connection");
        self.get_connection(&id)?
            .ok_or_else(|| StoreError::not_found("connection", id))
    }

    pub fn get_connection(&self, id: &str) -> StoreResult<Option<CalendarConnection>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {COLUMNS} FROM calendar_connections WHERE id = ?1"),
            params![id],
            from_row,
        );
        match result {
            Ok(connection) => Ok(Some(connection)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// Like [`get_connection`](Self::get_connection) but absent rows are an error.
    pub fn require_connection(&self, id: &str) -> StoreResult<CalendarConnection> {
        self.get_connection(id)?
            .ok_or_else(|| StoreError::not_found("connection", id))
    }

    pub fn list_connections_for_user(&self, user_id: &str) -> StoreResult<Vec<CalendarConnection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM calendar_connections WHERE user_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![user_id], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct users that have at least one connection.
    pub fn list_connected_users(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT user_id FROM calendar_connections ORDER BY user_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn find_connection_by_channel(&self, channel_id: &str) -> StoreResult<Option<CalendarConnection>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {COLUMNS} FROM calendar_connections WHERE channel_id = ?1"),
            params![channel_id],
            from_row,
        );
        match result {
            Ok(connection) => Ok(Some(connection)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    /// Connections whose channel expires before `deadline`, or that have none.
    ///
    /// Connections without a channel are included so renewal can register one.
    pub fn connections_needing_channel(&self, deadline: DateTime<Utc>) -> StoreResult<Vec<CalendarConnection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM calendar_connections
             WHERE channel_id IS NULL OR channel_expiration IS NULL OR channel_expiration < ?1
             ORDER BY channel_expiration"
        ))?;
        let rows = stmt.query_map(params![ts(deadline)], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_credentials(&self, id: &str, encrypted_credentials: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE calendar_connections SET encrypted_credentials = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, encrypted_credentials, ts(Utc::now())],
        )?;
        ensure_changed(changed, id)
    }

    /// Records the outcome of a sync attempt on the connection.
    pub fn record_sync_outcome(
        &self,
        id: &str,
        at: DateTime<Utc>,
        status: ConnectionSyncStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE calendar_connections
             SET last_sync_at = ?2, last_sync_status = ?3, last_sync_error = ?4, updated_at = ?2
             WHERE id = ?1",
            params![id, ts(at), status.as_str(), error],
        )?;
        ensure_changed(changed, id)
    }

    /// Replaces the connection's channel. There is at most one per connection.
    pub fn set_channel(&self, id: &str, channel: Option<&ChannelRegistration>) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE calendar_connections
             SET channel_id = ?2, channel_resource_id = ?3, channel_expiration = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                channel.map(|c| c.channel_id.as_str()),
                channel.map(|c| c.resource_id.as_str()),
                opt_ts(channel.and_then(|c| c.expiration)),
                ts(Utc::now()),
            ],
        )?;
        ensure_changed(changed, id)
    }

    pub fn set_sync_token(&self, id: &str, sync_token: Option<&str>) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE calendar_connections SET sync_token = ?2 WHERE id = ?1",
            params![id, sync_token],
        )?;
        ensure_changed(changed, id)
    }

    pub fn set_toggles(&self, id: &str, toggles: SyncToggles) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE calendar_connections
             SET sync_lms_events = ?2, sync_study_sessions = ?3, sync_external_events = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                toggles.lms_events,
                toggles.study_sessions,
                toggles.external_events,
                ts(Utc::now())
            ],
        )?;
        ensure_changed(changed, id)
    }

    /// Deletes the connection; its mappings and imported events cascade.
    ///
    /// Returns false if the connection did not exist.
    pub fn delete_connection(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM calendar_connections WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

fn ensure_changed(changed: usize, id: &str) -> StoreResult<()> {
    if changed == 0 {
        return Err(StoreError::not_found("connection", id));
    }
    Ok(())
}
