//! Orchestrator configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use hapisync_core::TimeWindow;
use hapisync_providers::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// What to do when both sides of a mapping changed since the last sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Block both writes and record a pending conflict for a human.
    #[default]
    Flag,
    /// Write the internal version to the provider.
    PreferSource,
    /// Keep the provider version and apply it internally where allowed.
    /// Read-only sources fall back to [`ConflictPolicy::Flag`].
    PreferExternal,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::PreferSource => "prefer_source",
            Self::PreferExternal => "prefer_external",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flag" => Ok(Self::Flag),
            "prefer_source" => Ok(Self::PreferSource),
            "prefer_external" => Ok(Self::PreferExternal),
            other => Err(SyncError::config(format!("unknown conflict policy: {other}"))),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How far ahead full passes look for source events.
    pub lookahead: Duration,
    /// Incremental passes cover `[now - lookback, now + lookahead]`.
    pub incremental_lookback: Duration,
    pub incremental_lookahead: Duration,
    /// Public URL of the webhook receiver. No channels are registered without it.
    pub webhook_url: Option<String>,
    /// Requested lifetime of push-notification channels.
    pub channel_ttl: StdDuration,
    /// Channels expiring within this window are renewed.
    pub renewal_buffer: Duration,
    pub conflict_policy: ConflictPolicy,
    /// When set, full syncs also take a lease row so that several processes
    /// sharing one database never sync the same user concurrently.
    pub lease_ttl: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookahead: Duration::days(90),
            incremental_lookback: Duration::days(1),
            incremental_lookahead: Duration::days(30),
            webhook_url: None,
            channel_ttl: StdDuration::from_secs(7 * 24 * 3600),
            renewal_buffer: Duration::hours(24),
            conflict_policy: ConflictPolicy::default(),
            lease_ttl: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Builder: set the full-sync lookahead.
    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// Builder: set the incremental window.
    pub fn with_incremental_window(mut self, lookback: Duration, lookahead: Duration) -> Self {
        self.incremental_lookback = lookback;
        self.incremental_lookahead = lookahead;
        self
    }

    /// Builder: set the webhook receiver URL.
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Builder: set channel TTL and renewal buffer.
    pub fn with_channel_renewal(mut self, ttl: StdDuration, buffer: Duration) -> Self {
        self.channel_ttl = ttl;
        self.renewal_buffer = buffer;
        self
    }

    /// Builder: set the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Builder: enable datastore leases.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Builder: set the provider retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Window of a full pass: future events only.
    pub fn full_window(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::from_now(now, self.lookahead)
    }

    pub fn incremental_window(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::around(now, self.incremental_lookback, self.incremental_lookahead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lookahead, Duration::days(90));
        assert_eq!(config.channel_ttl, StdDuration::from_secs(604_800));
        assert_eq!(config.conflict_policy, ConflictPolicy::Flag);
        assert!(config.webhook_url.is_none());
        assert!(config.lease_ttl.is_none());
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn windows() {
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap();
        let config = EngineConfig::default().with_lookahead(Duration::days(10));

        let full = config.full_window(now);
        assert_eq!(full.start, now);
        assert_eq!(full.end, now + Duration::days(10));

        let incremental = config.incremental_window(now);
        assert_eq!(incremental.start, now - Duration::days(1));
        assert_eq!(incremental.end, now + Duration::days(30));
    }

    #[test]
    fn conflict_policy_names() {
        for policy in [
            ConflictPolicy::Flag,
            ConflictPolicy::PreferSource,
            ConflictPolicy::PreferExternal,
        ] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert!("newest_wins".parse::<ConflictPolicy>().is_err());
    }
}
