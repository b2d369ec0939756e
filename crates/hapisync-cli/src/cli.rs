//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// hapisync - keeps student calendars in step with Google Calendar
#[derive(Debug, Parser)]
#[command(name = "hapisync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "HAPISYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run periodic full syncs and channel renewal until interrupted
    Serve {
        /// Skip the full sync normally run at startup
        #[arg(long)]
        no_initial_sync: bool,
    },

    /// Run one full sync for a user and print the report
    Sync {
        /// User to sync
        #[arg(long)]
        user: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the last sync report for a user
    Status {
        #[arg(long)]
        user: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a calendar connection and its push channel
    Disconnect {
        #[arg(long)]
        connection: String,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Dump,
    /// Check the configuration without contacting any service
    Validate,
    /// Print the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_sync_with_global_flags() {
        let cli = Cli::try_parse_from(["hapisync", "sync", "--user", "u-1", "--debug"]).unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Sync { user, json } => {
                assert_eq!(user, "u-1");
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn status_requires_user() {
        assert!(Cli::try_parse_from(["hapisync", "status"]).is_err());
    }
}
