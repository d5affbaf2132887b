//! TOML settings file and its defaults.
//!
//! Every field is optional; a missing file, section, or key falls back to the
//! built-in default. Connection strings given on the command line or through
//! the environment take precedence over the file (see
//! [`Connections::overlay`]).
//!
//! ```toml
//! [connections]
//! database_url = "postgres://app@db/channelpulse"
//! data_dir = "/var/lib/channelpulse"
//! kv_url = "https://kv.example.com"
//!
//! [tasks]
//! lock_ttl_secs = 900
//! entity_delay_ms = 500
//!
//! [schedule]
//! stats_sync_interval_secs = 3600
//! snapshot_prune_interval_secs = 86400
//!
//! [cache]
//! stats_ttl_secs = 300
//!
//! [retention]
//! snapshot_days = 90
//! ```

use crate::runner::RunnerConfig;
use crate::storage::StorageConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connections: Connections,
    pub tasks: TaskSettings,
    pub schedule: ScheduleSettings,
    pub cache: CacheSettings,
    pub retention: RetentionSettings,
    pub storage: StorageSettings,
}

/// External endpoints. Unset means "not configured".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connections {
    pub database_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub kv_url: Option<String>,
    pub kv_rest_token: Option<String>,
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
}

impl Connections {
    /// Fields set in `over` replace those in `self`.
    pub fn overlay(self, over: Connections) -> Connections {
        Connections {
            database_url: over.database_url.or(self.database_url),
            data_dir: over.data_dir.or(self.data_dir),
            kv_url: over.kv_url.or(self.kv_url),
            kv_rest_token: over.kv_rest_token.or(self.kv_rest_token),
            provider_url: over.provider_url.or(self.provider_url),
            provider_api_key: over.provider_api_key.or(self.provider_api_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub lock_ttl_secs: u64,
    pub entity_delay_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        TaskSettings {
            lock_ttl_secs: 900,
            entity_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Zero disables the schedule; manual runs still work.
    pub stats_sync_interval_secs: u64,
    pub snapshot_prune_interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        ScheduleSettings {
            stats_sync_interval_secs: 3600,
            snapshot_prune_interval_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub stats_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings { stats_ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub snapshot_days: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings { snapshot_days: 90 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub probe_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            probe_timeout_secs: 5,
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml_str(&content).with_context(|| format!("parsing config {}", p.display()))
            }
            None => Ok(Settings::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.lock_ttl_secs == 0 {
            bail!("tasks.lock_ttl_secs must be positive");
        }
        if self.retention.snapshot_days == 0 {
            bail!("retention.snapshot_days must be positive");
        }
        if self.cache.stats_ttl_secs == 0 {
            bail!("cache.stats_ttl_secs must be positive");
        }
        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            lock_ttl: Duration::from_secs(self.tasks.lock_ttl_secs),
            entity_delay: Duration::from_millis(self.tasks.entity_delay_ms),
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            database_url: self.connections.database_url.clone(),
            data_dir: self.connections.data_dir.clone(),
            probe_timeout: Duration::from_secs(self.storage.probe_timeout_secs.max(1)),
        }
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.stats_ttl_secs)
    }
}
