//! Runtime configuration.
//!
//! Loaded from an optional TOML file, then overridden by `CASTSYNC_*`
//! environment variables. Every section has defaults, so an empty file (or no
//! file) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CastError, Result};
use crate::executor::ExecutorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    /// Terminal commands older than this are deleted.
    pub window_secs: u64,
    /// Seconds between sweeps.
    pub interval_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self { window_secs: 300, interval_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub lease_ttl_secs: u64,
    pub heartbeat_secs: u64,
    /// Pause between retries while the store is unreachable.
    pub retry_backoff_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self { lease_ttl_secs: 15, heartbeat_secs: 5, retry_backoff_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsSection {
    pub max_code_attempts: u32,
}

impl Default for RoomsSection {
    fn default() -> Self {
        Self { max_code_attempts: crate::registry::DEFAULT_MAX_CODE_ATTEMPTS }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Broadcast buffer per room stream.
    pub channel_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { channel_capacity: crate::store::DEFAULT_CHANNEL_CAPACITY }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSection {
    /// 0 disables progress reporting.
    pub progress_interval_ms: u64,
}

impl Default for PlayerSection {
    fn default() -> Self {
        Self { progress_interval_ms: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    pub retention: RetentionSection,
    pub executor: ExecutorSection,
    pub rooms: RoomsSection,
    pub store: StoreSection,
    pub player: PlayerSection,
    pub log: LogSection,
}

impl CastConfig {
    /// Defaults, then `path` if given, then environment overrides; validated.
    /// Rejected overrides are logged through `tracing`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config, rejected) = Self::load_reporting(path)?;
        for warning in &rejected {
            tracing::warn!(target: "castsync::config", "{warning}");
        }
        Ok(config)
    }

    /// Like [`CastConfig::load`], but hands rejected overrides back to the
    /// caller. Used before a subscriber is installed.
    pub fn load_reporting(path: Option<&Path>) -> Result<(Self, Vec<String>)> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let rejected = config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok((config, rejected))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CastError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&contents)
            .map_err(|e| CastError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CastError::Config(format!("failed to parse: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CastError::Config(format!("failed to render: {e}")))
    }

    /// Apply `CASTSYNC_*` overrides read through `lookup`. Unparseable values
    /// are ignored; one warning per ignored value is returned.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut rejected = Vec::new();
        let mut number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<u64>() {
                Ok(value) => Some(value),
                Err(err) => {
                    rejected.push(format!("invalid {key}, ignoring: {err}"));
                    None
                }
            }
        };

        if let Some(v) = number("CASTSYNC_RETENTION_WINDOW_SECS") {
            self.retention.window_secs = v;
        }
        if let Some(v) = number("CASTSYNC_CLEANUP_INTERVAL_SECS") {
            self.retention.interval_secs = v;
        }
        if let Some(v) = number("CASTSYNC_LEASE_TTL_SECS") {
            self.executor.lease_ttl_secs = v;
        }
        if let Some(raw) = lookup("CASTSYNC_LOG") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.log.filter = trimmed.to_string();
            }
        }
        rejected
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("retention.window_secs", self.retention.window_secs),
            ("retention.interval_secs", self.retention.interval_secs),
            ("executor.lease_ttl_secs", self.executor.lease_ttl_secs),
            ("executor.heartbeat_secs", self.executor.heartbeat_secs),
            ("executor.retry_backoff_ms", self.executor.retry_backoff_ms),
            ("rooms.max_code_attempts", u64::from(self.rooms.max_code_attempts)),
            ("store.channel_capacity", self.store.channel_capacity as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(CastError::Config(format!("{name} must be greater than zero")));
        }
        if self.executor.heartbeat_secs >= self.executor.lease_ttl_secs {
            return Err(CastError::Config(
                "executor.heartbeat_secs must be shorter than executor.lease_ttl_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.player.progress_interval_ms)
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            lease_ttl: Duration::from_secs(self.executor.lease_ttl_secs),
            heartbeat: Duration::from_secs(self.executor.heartbeat_secs),
            retry_backoff: Duration::from_millis(self.executor.retry_backoff_ms),
        }
    }
}
