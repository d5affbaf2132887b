//! In-process document shared by the filesystem and memory backends.
//!
//! Both backends hold a [`StoreData`] and differ only in whether they write
//! it back to disk after each mutation.

use super::{Channel, ChannelUpdate, NewChannel, StatsSnapshot, TaskExecutionRecord};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution records kept per store. Older records are dropped first.
pub(crate) const MAX_EXECUTIONS: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshots: Vec<StatsSnapshot>,
    /// Oldest first.
    #[serde(default)]
    pub executions: Vec<TaskExecutionRecord>,
}

impl StoreData {
    pub fn list_channels(&self) -> Vec<Channel> {
        let mut channels = self.channels.clone();
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        channels
    }

    pub fn get_channel(&self, id: &str) -> Option<Channel> {
        self.channels.iter().find(|c| c.id == id).cloned()
    }

    pub fn add_channel(&mut self, new: &NewChannel) -> Result<Channel> {
        if self.channels.iter().any(|c| c.external_id == new.external_id) {
            bail!("channel with external id '{}' already exists", new.external_id);
        }
        let channel = Channel {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.clone(),
            external_id: new.external_id.clone(),
            timezone: new.timezone.clone(),
            syncing: false,
            last_synced_at: None,
            subscribers: None,
            views: None,
            videos: None,
            created_at: Utc::now(),
        };
        self.channels.push(channel.clone());
        Ok(channel)
    }

    pub fn update_channel(&mut self, id: &str, update: &ChannelUpdate) -> Option<Channel> {
        let channel = self.channels.iter_mut().find(|c| c.id == id)?;
        update.apply(channel);
        Some(channel.clone())
    }

    pub fn delete_channel(&mut self, id: &str) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| c.id != id);
        self.snapshots.retain(|s| s.channel_id != id);
        self.channels.len() != before
    }

    /// Returns whether the channel exists.
    pub fn set_in_progress(&mut self, id: &str, in_progress: bool) -> bool {
        match self.channels.iter_mut().find(|c| c.id == id) {
            Some(channel) => {
                channel.syncing = in_progress;
                true
            }
            None => false,
        }
    }

    pub fn add_snapshot(&mut self, snapshot: &StatsSnapshot) {
        self.snapshots.push(snapshot.clone());
    }

    pub fn list_snapshots(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<StatsSnapshot> {
        let mut out: Vec<StatsSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| s.channel_id == channel_id)
            .filter(|s| since.map_or(true, |t| s.captured_at >= t))
            .filter(|s| until.map_or(true, |t| s.captured_at < t))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.captured_at);
        out
    }

    pub fn prune_snapshots(&mut self, channel_id: &str, cutoff: DateTime<Utc>) -> u64 {
        let before = self.snapshots.len();
        self.snapshots
            .retain(|s| s.channel_id != channel_id || s.captured_at >= cutoff);
        (before - self.snapshots.len()) as u64
    }

    pub fn add_task_execution(&mut self, record: &TaskExecutionRecord) {
        self.executions.push(record.clone());
        if self.executions.len() > MAX_EXECUTIONS {
            let excess = self.executions.len() - MAX_EXECUTIONS;
            self.executions.drain(..excess);
        }
    }

    pub fn list_task_executions(&self, limit: usize) -> Vec<TaskExecutionRecord> {
        self.executions.iter().rev().take(limit).cloned().collect()
    }
}
