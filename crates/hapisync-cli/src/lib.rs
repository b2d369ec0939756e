//! The `hapisync` binary: configuration loading, the background daemon and
//! one-shot maintenance commands.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod secret;

pub use cli::Cli;
pub use config::HapisyncConfig;
pub use error::{CliError, CliResult};
