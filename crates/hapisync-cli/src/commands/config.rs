//! Configuration commands.

use std::path::Path;

use crate::config::HapisyncConfig;
use crate::error::{CliError, CliResult};
use crate::secret;

/// Prints the effective configuration. Inline secrets are masked; references
/// are shown as written.
pub fn dump(config: &HapisyncConfig, path: Option<&Path>) -> CliResult<()> {
    let toml_str = toml::to_string_pretty(&masked(config))
        .map_err(|e| CliError::config(format!("failed to serialize config: {}", e)))?;
    let path = path.map_or_else(HapisyncConfig::default_path, Path::to_path_buf);
    println!("# config.toml ({})", path.display());
    println!("{}", toml_str);
    Ok(())
}

pub fn validate(config: &HapisyncConfig) -> CliResult<()> {
    config.validate()?;
    if config.google.is_some() {
        config.google_config()?;
        println!("Google credentials are valid.");
    }
    if config.encryption.key.is_some() {
        config.token_cipher()?;
        println!("Encryption key is valid.");
    }
    println!("Configuration is valid.");
    Ok(())
}

pub fn path(path: Option<&Path>) -> CliResult<()> {
    let path = path.map_or_else(HapisyncConfig::default_path, Path::to_path_buf);
    println!("config: {}", path.display());
    println!("database: {}", HapisyncConfig::default_data_dir().join("hapisync.db").display());
    Ok(())
}

fn masked(config: &HapisyncConfig) -> HapisyncConfig {
    fn mask(value: &mut Option<String>) {
        if let Some(v) = value
            && !secret::is_reference(v)
        {
            *v = "[REDACTED]".to_string();
        }
    }
    let mut config = config.clone();
    if let Some(google) = config.google.as_mut() {
        mask(&mut google.client_secret);
    }
    mask(&mut config.encryption.key);
    config
}
