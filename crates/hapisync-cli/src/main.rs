//! hapisync CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use hapisync_cli::cli::{Cli, Command, ConfigAction};
use hapisync_cli::commands;
use hapisync_cli::config::HapisyncConfig;
use hapisync_cli::error::CliResult;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = HapisyncConfig::load(cli.config.as_deref())?;

    let daemon = matches!(cli.command, Command::Serve { .. });
    hapisync_core::init_tracing(config.tracing_config(daemon, cli.debug)?)?;

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, cli.config.as_deref()),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(cli.config.as_deref()),
        },
        Command::Serve { no_initial_sync } => {
            let engine = commands::build_engine(&config)?;
            commands::serve::run(engine, &config, !no_initial_sync).await
        }
        Command::Sync { user, json } => {
            let engine = commands::build_engine(&config)?;
            commands::engine::sync(&engine, &user, json).await
        }
        Command::Status { user, json } => {
            let engine = commands::build_engine(&config)?;
            commands::engine::status(&engine, &user, json).await
        }
        Command::Disconnect { connection } => {
            let engine = commands::build_engine(&config)?;
            commands::engine::disconnect(&engine, &connection).await
        }
    }
}
