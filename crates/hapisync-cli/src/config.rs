//! Daemon configuration.
//!
//! All settings live in a single `config.toml`, by default at
//! `~/.config/hapisync/config.toml`.
//!
//! Secret values (`client_id`, `client_secret`, the encryption key) accept
//! references:
//! - `pass::path/in/store` is resolved via `pass show`
//! - `env::VAR_NAME` is read from the environment
//! - plain text is used as-is

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use hapisync_core::{TracingConfig, TracingOutputFormat};
use hapisync_providers::google::{GoogleConfig, OAuthCredentials};
use hapisync_providers::{RetryPolicy, TokenCipher};
use hapisync_server::{ConflictPolicy, EngineConfig, SchedulerConfig};
use hapisync_store::StoreOptions;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CliError, CliResult};
use crate::secret;

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HapisyncConfig {
    pub database: DatabaseSettings,
    pub google: Option<GoogleSettings>,
    pub sync: SyncSettings,
    pub encryption: EncryptionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `hapisync.db` in the data directory.
    pub path: Option<PathBuf>,
    /// Enables datastore leases so several daemons can share one database.
    pub lease_ttl_secs: Option<u64>,
    /// Pooled SQLite connections.
    pub pool_size: Option<u32>,
    /// Upper bound for one datastore call before it is reported as busy.
    pub call_timeout_secs: Option<u64>,
}

/// Google Calendar settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoogleSettings {
    /// OAuth client ID (supports `pass::` and `env::`).
    pub client_id: Option<String>,
    /// OAuth client secret (supports `pass::` and `env::`).
    pub client_secret: Option<String>,
    /// Google Cloud Console credentials JSON, used when the two values above
    /// are absent.
    pub credentials_file: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds between background full syncs.
    pub interval_secs: u64,
    pub lookahead_days: i64,
    pub incremental_lookback_days: i64,
    pub incremental_lookahead_days: i64,
    /// Public URL receiving push notifications. Push channels are only
    /// registered when set.
    pub webhook_url: Option<String>,
    pub channel_ttl_hours: u64,
    /// Seconds between channel renewal sweeps.
    pub renewal_interval_secs: u64,
    pub renewal_buffer_hours: i64,
    pub conflict_policy: ConflictPolicy,
    pub max_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            lookahead_days: 90,
            incremental_lookback_days: 1,
            incremental_lookahead_days: 30,
            webhook_url: None,
            channel_ttl_hours: 7 * 24,
            renewal_interval_secs: 3600,
            renewal_buffer_hours: 24,
            conflict_policy: ConflictPolicy::Flag,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Base64 AES-256 key sealing stored credentials (supports `pass::` and
    /// `env::`).
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty`, `compact` or `json`. Defaults to json for `serve`.
    pub format: Option<String>,
    /// Filter directive overriding `level`, e.g. `hapisync_server=debug`.
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            filter: None,
        }
    }
}

impl HapisyncConfig {
    /// Loads `path`, or the default file when `path` is `None`.
    ///
    /// An explicit path must exist; a missing default file yields the
    /// default configuration.
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| CliError::config(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hapisync")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hapisync")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("hapisync.db"))
    }

    pub fn store_options(&self) -> CliResult<StoreOptions> {
        let mut options = StoreOptions::default();
        if let Some(size) = self.database.pool_size {
            if size == 0 {
                return Err(CliError::config("pool_size must be positive"));
            }
            options.pool_size = size;
        }
        if let Some(secs) = self.database.call_timeout_secs {
            if secs == 0 {
                return Err(CliError::config("call_timeout_secs must be positive"));
            }
            options.call_timeout = StdDuration::from_secs(secs);
        }
        Ok(options)
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> CliResult<()> {
        self.engine_config()?;
        self.store_options()?;
        if self.sync.interval_secs == 0 || self.sync.renewal_interval_secs == 0 {
            return Err(CliError::config("scheduler intervals must be positive"));
        }
        if let Some(format) = &self.logging.format {
            TracingOutputFormat::from_str(format)?;
        }
        hapisync_core::tracing::parse_level(&self.logging.level)?;
        Ok(())
    }

    pub fn engine_config(&self) -> CliResult<EngineConfig> {
        let sync = &self.sync;
        if sync.lookahead_days <= 0 || sync.incremental_lookahead_days <= 0 {
            return Err(CliError::config("lookahead windows must be positive"));
        }
        if sync.incremental_lookback_days < 0 || sync.renewal_buffer_hours < 0 {
            return Err(CliError::config("lookback and renewal buffer must not be negative"));
        }
        if sync.channel_ttl_hours == 0 {
            return Err(CliError::config("channel_ttl_hours must be positive"));
        }

        let mut config = EngineConfig::default()
            .with_lookahead(Duration::days(sync.lookahead_days))
            .with_incremental_window(
                Duration::days(sync.incremental_lookback_days),
                Duration::days(sync.incremental_lookahead_days),
            )
            .with_channel_renewal(
                StdDuration::from_secs(sync.channel_ttl_hours * 3600),
                Duration::hours(sync.renewal_buffer_hours),
            )
            .with_conflict_policy(sync.conflict_policy)
            .with_retry(RetryPolicy::default().with_max_attempts(sync.max_attempts.max(1)));
        if let Some(url) = &sync.webhook_url {
            let parsed = Url::parse(url)
                .map_err(|e| CliError::config(format!("invalid webhook_url: {e}")))?;
            if parsed.scheme() != "https" {
                return Err(CliError::config("webhook_url must be an https URL"));
            }
            config = config.with_webhook_url(parsed.as_str());
        }
        if let Some(secs) = self.database.lease_ttl_secs {
            config = config.with_lease_ttl(Duration::seconds(secs as i64));
        }
        Ok(config)
    }

    pub fn sync_scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::new("full-sync", StdDuration::from_secs(self.sync.interval_secs))
    }

    pub fn renewal_scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::new(
            "channel-renewal",
            StdDuration::from_secs(self.sync.renewal_interval_secs),
        )
    }

    /// Builds the Google client configuration, resolving secret references.
    pub fn google_config(&self) -> CliResult<GoogleConfig> {
        let google = self
            .google
            .as_ref()
            .ok_or_else(|| CliError::config("missing [google] section"))?;
        let credentials = google.resolve_credentials()?;
        credentials
            .validate()
            .map_err(|e| CliError::config(format!("invalid Google credentials: {e}")))?;

        let mut config = GoogleConfig::new(credentials);
        if let Some(url) = &google.api_base_url {
            config = config.with_api_base_url(url.clone());
        }
        if let Some(secs) = google.timeout_secs {
            config = config.with_timeout(StdDuration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn token_cipher(&self) -> CliResult<TokenCipher> {
        let key = self
            .encryption
            .key
            .as_deref()
            .ok_or_else(|| CliError::config("missing [encryption] key"))?;
        Ok(TokenCipher::from_base64_key(&secret::resolve(key)?)?)
    }

    /// Logging setup: `serve` defaults to JSON, one-shot commands to compact
    /// output. `--debug` wins over the file.
    pub fn tracing_config(&self, daemon: bool, debug: bool) -> CliResult<TracingConfig> {
        if debug {
            return Ok(TracingConfig::cli_debug());
        }
        let base = if daemon {
            TracingConfig::daemon()
        } else {
            TracingConfig::default().with_format(TracingOutputFormat::Compact)
        };
        let mut config = base.with_level(hapisync_core::tracing::parse_level(&self.logging.level)?);
        if let Some(format) = &self.logging.format {
            config = config.with_format(TracingOutputFormat::from_str(format)?);
        }
        if let Some(filter) = &self.logging.filter {
            config = config.with_env_filter(filter.clone());
        }
        Ok(config)
    }
}

impl GoogleSettings {
    /// Resolves OAuth credentials from inline values or the credentials file.
    pub fn resolve_credentials(&self) -> CliResult<OAuthCredentials> {
        match (&self.client_id, &self.client_secret, &self.credentials_file) {
            (Some(id), Some(secret), _) => Ok(OAuthCredentials::new(
                secret::resolve(id)?,
                secret::resolve(secret)?,
            )),
            (None, None, Some(path)) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    CliError::config(format!("failed to read {}: {}", path.display(), e))
                })?;
                OAuthCredentials::from_json(&json).map_err(CliError::Config)
            }
            (None, None, None) => Err(CliError::config(
                "set client_id and client_secret, or credentials_file",
            )),
            _ => Err(CliError::config(
                "client_id and client_secret must be set together",
            )),
        }
    }
}
