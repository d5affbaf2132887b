//! Filesystem storage: one JSON document in the data directory.
//!
//! Every mutation rewrites `store.json` through a temp file and a rename, so
//! readers never see a half-written document. Mutations are applied to a copy
//! and only become visible once the write succeeded.

use super::data::StoreData;
use super::{Channel, ChannelUpdate, NewChannel, StatsSnapshot, TaskExecutionRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const STORE_FILE: &str = "store.json";

#[derive(Clone)]
pub struct FileStorage {
    path: PathBuf,
    data: Arc<Mutex<StoreData>>,
}

impl FileStorage {
    /// Probe `dir` for write access and load any existing document.
    ///
    /// The probe creates and removes a marker file; an existing directory is
    /// not proof that it accepts writes.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating data dir {}", dir.display()))?;
        probe_writable(dir).await?;

        let path = dir.join(STORE_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(FileStorage {
            path,
            data: Arc::new(Mutex::new(data)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        let data = self.data.lock().await;
        f(&data)
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut StoreData) -> Result<R>) -> Result<R> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let out = f(&mut next)?;
        write_atomic(&self.path, &next).await?;
        *data = next;
        Ok(out)
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.read(|d| d.list_channels()).await)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        Ok(self.read(|d| d.get_channel(id)).await)
    }

    pub async fn add_channel(&self, new: &NewChannel) -> Result<Channel> {
        self.mutate(|d| d.add_channel(new)).await
    }

    pub async fn update_channel(&self, id: &str, update: &ChannelUpdate) -> Result<Option<Channel>> {
        self.mutate(|d| Ok(d.update_channel(id, update))).await
    }

    pub async fn delete_channel(&self, id: &str) -> Result<bool> {
        self.mutate(|d| Ok(d.delete_channel(id))).await
    }

    pub async fn set_in_progress(&self, id: &str, in_progress: bool) -> Result<()> {
        self.mutate(|d| {
            d.set_in_progress(id, in_progress);
            Ok(())
        })
        .await
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(|d| d.config.get(key).cloned()).await)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|d| {
            d.config.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    pub async fn add_snapshot(&self, snapshot: &StatsSnapshot) -> Result<()> {
        self.mutate(|d| {
            d.add_snapshot(snapshot);
            Ok(())
        })
        .await
    }

    pub async fn list_snapshots(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatsSnapshot>> {
        Ok(self.read(|d| d.list_snapshots(channel_id, since, until)).await)
    }

    pub async fn prune_snapshots(&self, channel_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        self.mutate(|d| Ok(d.prune_snapshots(channel_id, cutoff))).await
    }

    pub async fn add_task_execution(&self, record: &TaskExecutionRecord) -> Result<()> {
        self.mutate(|d| {
            d.add_task_execution(record);
            Ok(())
        })
        .await
    }

    pub async fn list_task_executions(&self, limit: usize) -> Result<Vec<TaskExecutionRecord>> {
        Ok(self.read(|d| d.list_task_executions(limit)).await)
    }
}

async fn probe_writable(dir: &Path) -> Result<()> {
    let marker = dir.join(format!(".channelpulse-probe-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&marker, b"probe")
        .await
        .with_context(|| format!("data dir {} is not writable", dir.display()))?;
    tokio::fs::remove_file(&marker)
        .await
        .with_context(|| format!("removing probe file {}", marker.display()))?;
    debug!(dir = %dir.display(), "filesystem write probe passed");
    Ok(())
}

async fn write_atomic(path: &Path, data: &StoreData) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(data)?;
    let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}
