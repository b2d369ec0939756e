//! SQLite persistence for the sync engine.
//!
//! The engine owns four tables (connections, event mappings, sync runs and
//! sync conflicts) plus imported external events and lease rows. The LMS and
//! study-session tables belong to other subsystems; the engine reads them and
//! only soft-deletes or updates study sessions after the editability guard.
//!
//! [`Store`] wraps an r2d2 pool. Its methods are blocking; async callers go
//! through [`Store::call`], which runs them on the blocking pool under
//! [`StoreOptions::call_timeout`].

mod codec;
mod conflicts;
mod connections;
mod error;
mod leases;
mod mappings;
mod models;
mod runs;
mod sources;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, warn};

pub use error::{StoreError, StoreResult};
pub use models::{
    CalendarConnection, ChannelRegistration, ConnectionSyncStatus, EventMapping, ImportedEvent,
    MappingStatus, ModifiedBy, NewConflict, NewConnection, ResolutionAction, ResolutionStatus,
    RunStatus, RunType, SyncConflict, SyncRun, SyncStats, SyncToggles,
};

/// SQLite lock wait applied to every statement.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool and timeout settings.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Connections kept open against a database file.
    pub pool_size: u32,
    /// Upper bound for one [`Store::call`], pool checkout included.
    pub call_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS calendar_connections (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    account_email TEXT,
    calendar_id TEXT NOT NULL,
    timezone TEXT,
    sync_lms_events INTEGER NOT NULL DEFAULT 1,
    sync_study_sessions INTEGER NOT NULL DEFAULT 1,
    sync_external_events INTEGER NOT NULL DEFAULT 1,
    encrypted_credentials TEXT NOT NULL,
    last_sync_at TEXT,
    last_sync_status TEXT,
    last_sync_error TEXT,
    channel_id TEXT UNIQUE,
    channel_resource_id TEXT,
    channel_expiration TEXT,
    sync_token TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_connections_user ON calendar_connections(user_id);

CREATE TABLE IF NOT EXISTS event_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    connection_id TEXT NOT NULL REFERENCES calendar_connections(id) ON DELETE CASCADE,
    source_system TEXT NOT NULL,
    source_id TEXT NOT NULL,
    external_event_id TEXT,
    hapi_version_hash TEXT,
    external_version_hash TEXT,
    sync_status TEXT NOT NULL,
    last_modified_by TEXT,
    hapi_deleted INTEGER NOT NULL DEFAULT 0,
    external_deleted INTEGER NOT NULL DEFAULT 0,
    hapi_snapshot TEXT,
    external_snapshot TEXT,
    last_error TEXT,
    last_synced_at TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, connection_id, source_system, source_id)
);
CREATE INDEX IF NOT EXISTS idx_mappings_external ON event_mappings(connection_id, external_event_id);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    connection_id TEXT,
    run_type TEXT NOT NULL,
    status TEXT NOT NULL,
    events_created INTEGER NOT NULL DEFAULT 0,
    events_updated INTEGER NOT NULL DEFAULT 0,
    events_deleted INTEGER NOT NULL DEFAULT 0,
    conflicts INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms INTEGER,
    error_summary TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_user ON sync_runs(user_id, started_at);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mapping_id INTEGER NOT NULL REFERENCES event_mappings(id) ON DELETE CASCADE,
    conflict_type TEXT NOT NULL,
    hapi_snapshot TEXT,
    external_snapshot TEXT,
    resolution_status TEXT NOT NULL,
    resolution_action TEXT,
    detected_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_conflicts_mapping ON sync_conflicts(mapping_id, resolution_status);

CREATE TABLE IF NOT EXISTS lms_events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    course_code TEXT,
    location TEXT,
    start_at TEXT NOT NULL,
    end_at TEXT,
    all_day INTEGER NOT NULL DEFAULT 0,
    span_start TEXT NOT NULL,
    span_end TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lms_events_span ON lms_events(user_id, span_start);

CREATE TABLE IF NOT EXISTS study_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    notes TEXT,
    location TEXT,
    start_at TEXT NOT NULL,
    end_at TEXT,
    all_day INTEGER NOT NULL DEFAULT 0,
    span_start TEXT NOT NULL,
    span_end TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_study_sessions_span ON study_sessions(user_id, span_start);

CREATE TABLE IF NOT EXISTS imported_events (
    connection_id TEXT NOT NULL REFERENCES calendar_connections(id) ON DELETE CASCADE,
    external_event_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    event TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (connection_id, external_event_id)
);

CREATE TABLE IF NOT EXISTS sync_leases (
    lease_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

/// Handle to the engine's SQLite database. Clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    call_timeout: Duration,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("pool_size", &self.pool.max_size())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

fn configure(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)
}

impl Store {
    /// Opens (and creates if needed) a database file with default options.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL;\nPRAGMA synchronous=NORMAL;")?;
            configure(conn)
        });
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .connection_timeout(options.call_timeout)
            .build(manager)?;
        debug!(path = %path.display(), pool_size = pool.max_size(), "opened database");
        Self::init(pool, options.call_timeout)
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds a single connection that is never recycled, since the
    /// database lives only as long as it does.
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(configure);
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::init(pool, StoreOptions::default().call_timeout)
    }

    fn init(pool: Pool<SqliteConnectionManager>, call_timeout: Duration) -> StoreResult<Self> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool, call_timeout })
    }

    /// Overrides the bound applied by [`Store::call`].
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub(crate) fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Runs blocking store work off the async runtime.
    ///
    /// Fails with [`StoreError::Timeout`] once `call_timeout` elapses. The
    /// statement itself is not interrupted and may still complete.
    pub fn call<T, F>(&self, work: F) -> impl Future<Output = StoreResult<T>> + Send + 'static
    where
        F: FnOnce(&Store) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let limit = self.call_timeout;
        async move {
            let task = tokio::task::spawn_blocking(move || work(&store));
            match tokio::time::timeout(limit, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(StoreError::Task(join.to_string())),
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "datastore call timed out");
                    Err(StoreError::Timeout(limit))
                }
            }
        }
    }
}
