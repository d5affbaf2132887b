//! Process-lifetime storage. Terminal fallback of the backend probe.
//!
//! Operations return `Result` for a uniform surface, but the only error is a
//! duplicate channel external id, which every backend rejects.

use super::data::StoreData;
use super::{Channel, ChannelUpdate, NewChannel, StatsSnapshot, TaskExecutionRecord};
use crate::lock_or_recover;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<StoreData>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(lock_or_recover(&self.data).list_channels())
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        Ok(lock_or_recover(&self.data).get_channel(id))
    }

    pub async fn add_channel(&self, new: &NewChannel) -> Result<Channel> {
        lock_or_recover(&self.data).add_channel(new)
    }

    pub async fn update_channel(&self, id: &str, update: &ChannelUpdate) -> Result<Option<Channel>> {
        Ok(lock_or_recover(&self.data).update_channel(id, update))
    }

    pub async fn delete_channel(&self, id: &str) -> Result<bool> {
        Ok(lock_or_recover(&self.data).delete_channel(id))
    }

    pub async fn set_in_progress(&self, id: &str, in_progress: bool) -> Result<()> {
        lock_or_recover(&self.data).set_in_progress(id, in_progress);
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(lock_or_recover(&self.data).config.get(key).cloned())
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        lock_or_recover(&self.data)
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn add_snapshot(&self, snapshot: &StatsSnapshot) -> Result<()> {
        lock_or_recover(&self.data).add_snapshot(snapshot);
        Ok(())
    }

    pub async fn list_snapshots(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatsSnapshot>> {
        Ok(lock_or_recover(&self.data).list_snapshots(channel_id, since, until))
    }

    pub async fn prune_snapshots(&self, channel_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(lock_or_recover(&self.data).prune_snapshots(channel_id, cutoff))
    }

    pub async fn add_task_execution(&self, record: &TaskExecutionRecord) -> Result<()> {
        lock_or_recover(&self.data).add_task_execution(record);
        Ok(())
    }

    pub async fn list_task_executions(&self, limit: usize) -> Result<Vec<TaskExecutionRecord>> {
        Ok(lock_or_recover(&self.data).list_task_executions(limit))
    }
}
