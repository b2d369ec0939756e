//! Sync orchestrator: full and incremental passes, channel renewal, scheduler.
//!
//! This crate drives the two-way synchronisation between the internal
//! sources (LMS events, study sessions) and one external calendar per
//! connection:
//! - [`SyncEngine::perform_full_sync`] reconciles every connection of a user
//! - [`SyncEngine::handle_webhook`] runs incremental passes on push
//!   notifications
//! - [`SyncEngine::renew_channels`] keeps push channels alive
//! - [`Scheduler`] runs full syncs and renewal periodically
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hapisync_providers::{MemoryProvider, TokenCipher};
//! use hapisync_server::{EngineConfig, SyncEngine};
//! use hapisync_store::Store;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(Store::open("hapisync.db")?);
//!     let cipher = TokenCipher::from_base64_key(&TokenCipher::generate_key())?;
//!     let engine = SyncEngine::new(store, MemoryProvider::new(), cipher, EngineConfig::default());
//!
//!     let report = engine.perform_full_sync("user-1", None).await?;
//!     println!("created {}", report.stats.events_created);
//!     Ok(())
//! }
//! ```

mod config;
mod engine;
mod error;
mod locks;
mod scheduler;
mod tokens;
mod webhook;

pub use config::{ConflictPolicy, EngineConfig};
pub use engine::{
    ConnectRequest, ConnectionReport, ProgressSink, RenewalSummary, RunReport, SyncEngine,
};
pub use error::{RECONNECT_MESSAGE, RETRY_LATER_MESSAGE, SyncError, SyncResult};
pub use locks::KeyedLocks;
pub use scheduler::{Scheduler, SchedulerCommand, SchedulerConfig, SchedulerHandle, SchedulerState};
pub use tokens::TokenManager;
pub use webhook::{WebhookNotification, WebhookOutcome};
