//! # Storage — Capability-Probed Persistence Backends
//!
//! Durable state (channels, configuration, stats snapshots, task execution
//! records) lives in one of three backends behind a single CRUD surface:
//!
//! | Priority | Variant | Probe |
//! |----------|---------|-------|
//! | 1 | [`Storage::Postgres`] | connect + `SELECT 1`, then schema setup |
//! | 2 | [`Storage::Filesystem`] | write then delete a marker file in the data dir |
//! | 3 | [`Storage::Memory`] | none; never fails, never persists |
//!
//! The filesystem probe performs a real write because read-only and
//! serverless filesystems report directories as existing while rejecting
//! writes.
//!
//! ## Memoization
//!
//! [`StorageSelector`] runs the probes on first use and keeps the result for
//! its own lifetime. The application holds exactly one selector inside its
//! [`AppContext`](crate::context::AppContext); constructing a new selector is
//! the only way to re-probe.
//!
//! ## Module Structure
//!
//! - [`postgres`]: `sqlx` queries against the relational schema
//! - [`file`]: JSON document in the data directory, atomic rewrites
//! - [`memory`]: process-lifetime state
//! - `data`: collection logic shared by the file and memory backends

mod data;
pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Upper bound on persisted task messages.
pub const MAX_TASK_MESSAGE_CHARS: usize = 1000;

// ── Channel types ───────────────────────────────────────────────

/// A tracked channel whose metrics are pulled by the sync task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub external_id: String,
    /// IANA zone used to bucket activity into calendar days.
    pub timezone: String,
    /// Set while a batch task is working on this channel.
    pub syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub subscribers: Option<i64>,
    pub views: Option<i64>,
    pub videos: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub external_id: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Partial update; `None` fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub subscribers: Option<i64>,
    pub views: Option<i64>,
    pub videos: Option<i64>,
}

impl ChannelUpdate {
    pub(crate) fn apply(&self, channel: &mut Channel) {
        if let Some(name) = &self.name {
            channel.name = name.clone();
        }
        if let Some(tz) = &self.timezone {
            channel.timezone = tz.clone();
        }
        if self.last_synced_at.is_some() {
            channel.last_synced_at = self.last_synced_at;
        }
        if self.subscribers.is_some() {
            channel.subscribers = self.subscribers;
        }
        if self.views.is_some() {
            channel.views = self.views;
        }
        if self.videos.is_some() {
            channel.videos = self.videos;
        }
    }
}

/// Point-in-time metrics for one channel, written by each successful sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatsSnapshot {
    pub channel_id: String,
    pub captured_at: DateTime<Utc>,
    pub subscribers: i64,
    pub views: i64,
    pub videos: i64,
}

// ── Task execution types ────────────────────────────────────────

/// The named batch tasks. The name doubles as the lock name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    StatsSync,
    SnapshotPrune,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::StatsSync, TaskType::SnapshotPrune];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::StatsSync => "stats_sync",
            TaskType::SnapshotPrune => "snapshot_prune",
        }
    }

    /// Name of the advisory lock guarding this task.
    pub fn lock_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    /// Accepts both `stats_sync` and the CLI spelling `stats-sync`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().replace('-', "_").as_str() {
            "stats_sync" => Ok(TaskType::StatsSync),
            "snapshot_prune" => Ok(TaskType::SnapshotPrune),
            other => Err(anyhow!(
                "unknown task '{}' (expected stats-sync or snapshot-prune)",
                other
            )),
        }
    }
}

/// Final state of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Every entity succeeded.
    Succeeded,
    /// The batch ran to completion but some entities failed.
    Failed,
    /// Another run held the lock; nothing ran.
    Skipped,
    /// The batch could not run: entity enumeration or the lock itself failed.
    Fatal,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Fatal => "fatal",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "fatal" => Ok(TaskStatus::Fatal),
            other => Err(anyhow!("unknown task status '{}'", other)),
        }
    }
}

/// Audit record for one batch run. Written once, when the run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub task_type: TaskType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub status: TaskStatus,
    pub success_count: u32,
    pub failure_count: u32,
    /// Human-readable summary, at most [`MAX_TASK_MESSAGE_CHARS`] chars.
    pub message: String,
    pub duration_ms: i64,
}

// ── Backend selection ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Postgres,
    Filesystem,
    Memory,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Postgres => write!(f, "postgres"),
            StorageKind::Filesystem => write!(f, "filesystem"),
            StorageKind::Memory => write!(f, "memory"),
        }
    }
}

/// Inputs to the capability probes.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Upper bound on the Postgres probe, connection included.
    pub probe_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_url: None,
            data_dir: None,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Probes backends once and hands out the winner for the rest of its life.
pub struct StorageSelector {
    config: StorageConfig,
    chosen: OnceCell<Storage>,
}

impl StorageSelector {
    pub fn new(config: StorageConfig) -> Self {
        StorageSelector {
            config,
            chosen: OnceCell::new(),
        }
    }

    /// A selector that is already resolved to `storage`, skipping the probes.
    pub fn with_storage(storage: Storage) -> Self {
        StorageSelector {
            config: StorageConfig::default(),
            chosen: OnceCell::new_with(Some(storage)),
        }
    }

    /// The selected backend, probing on the first call.
    pub async fn get(&self) -> &Storage {
        self.chosen.get_or_init(|| probe(&self.config)).await
    }

    /// The selected backend kind, if probing already happened.
    pub fn selected(&self) -> Option<StorageKind> {
        self.chosen.get().map(Storage::kind)
    }
}

/// Run the probes in priority order. Never fails: the in-memory backend is
/// the terminal fallback.
pub async fn probe(config: &StorageConfig) -> Storage {
    if let Some(url) = config.database_url.as_deref().filter(|u| !u.is_empty()) {
        match tokio::time::timeout(config.probe_timeout, PgStorage::connect(url, config.probe_timeout)).await {
            Ok(Ok(pg)) => {
                info!(backend = "postgres", "storage backend selected");
                return Storage::Postgres(pg);
            }
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "storage: postgres probe failed"),
            Err(_) => warn!(
                timeout_secs = config.probe_timeout.as_secs(),
                "storage: postgres probe timed out"
            ),
        }
    }

    if let Some(dir) = &config.data_dir {
        match FileStorage::open(dir).await {
            Ok(fs) => {
                info!(backend = "filesystem", dir = %dir.display(), "storage backend selected");
                return Storage::Filesystem(fs);
            }
            Err(e) => warn!(
                dir = %dir.display(),
                error = %format!("{e:#}"),
                "storage: filesystem probe failed"
            ),
        }
    }

    warn!("storage: using in-memory backend; data will not survive a restart");
    Storage::Memory(MemoryStorage::new())
}

// ── Backend dispatch ────────────────────────────────────────────

pub enum Storage {
    Postgres(PgStorage),
    Filesystem(FileStorage),
    Memory(MemoryStorage),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            Storage::Postgres($backend) => $call,
            Storage::Filesystem($backend) => $call,
            Storage::Memory($backend) => $call,
        }
    };
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Postgres(_) => StorageKind::Postgres,
            Storage::Filesystem(_) => StorageKind::Filesystem,
            Storage::Memory(_) => StorageKind::Memory,
        }
    }

    /// Whether data written here survives a process restart.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Storage::Memory(_))
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        dispatch!(self, s => s.list_channels().await)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        dispatch!(self, s => s.get_channel(id).await)
    }

    pub async fn add_channel(&self, new: &NewChannel) -> Result<Channel> {
        crate::daybucket::validate_timezone(&new.timezone)?;
        dispatch!(self, s => s.add_channel(new).await)
    }

    pub async fn update_channel(&self, id: &str, update: &ChannelUpdate) -> Result<Option<Channel>> {
        if let Some(tz) = &update.timezone {
            crate::daybucket::validate_timezone(tz)?;
        }
        dispatch!(self, s => s.update_channel(id, update).await)
    }

    /// Delete a channel and its snapshots. Returns whether it existed.
    pub async fn delete_channel(&self, id: &str) -> Result<bool> {
        dispatch!(self, s => s.delete_channel(id).await)
    }

    /// Set or clear the in-progress marker on a channel.
    pub async fn set_in_progress(&self, id: &str, in_progress: bool) -> Result<()> {
        dispatch!(self, s => s.set_in_progress(id, in_progress).await)
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        dispatch!(self, s => s.get_config(key).await)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        dispatch!(self, s => s.set_config(key, value).await)
    }

    pub async fn add_snapshot(&self, snapshot: &StatsSnapshot) -> Result<()> {
        dispatch!(self, s => s.add_snapshot(snapshot).await)
    }

    /// Snapshots for a channel within `[since, until)`, oldest first.
    pub async fn list_snapshots(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatsSnapshot>> {
        dispatch!(self, s => s.list_snapshots(channel_id, since, until).await)
    }

    /// Delete a channel's snapshots captured before `cutoff`.
    pub async fn prune_snapshots(&self, channel_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        dispatch!(self, s => s.prune_snapshots(channel_id, cutoff).await)
    }

    pub async fn add_task_execution(&self, record: &TaskExecutionRecord) -> Result<()> {
        dispatch!(self, s => s.add_task_execution(record).await)
    }

    /// Most recent execution records first.
    pub async fn list_task_executions(&self, limit: usize) -> Result<Vec<TaskExecutionRecord>> {
        dispatch!(self, s => s.list_task_executions(limit).await)
    }
}
