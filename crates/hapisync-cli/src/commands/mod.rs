//! Subcommand implementations.

pub mod config;
pub mod engine;
pub mod serve;

use std::sync::Arc;

use hapisync_providers::google::GoogleCalendarClient;
use hapisync_server::SyncEngine;
use hapisync_store::Store;
use tracing::debug;

use crate::config::HapisyncConfig;
use crate::error::CliResult;

/// Opens the datastore and wires the engine to Google Calendar.
pub fn build_engine(config: &HapisyncConfig) -> CliResult<SyncEngine> {
    let engine_config = config.engine_config()?;
    let cipher = config.token_cipher()?;
    let client = GoogleCalendarClient::new(config.google_config()?)?;

    let path = config.database_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open_with(&path, config.store_options()?)?);
    debug!(path = %path.display(), "datastore opened");

    Ok(SyncEngine::new(store, client, cipher, engine_config))
}
