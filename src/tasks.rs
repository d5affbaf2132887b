//! # Tasks — The Batch Jobs
//!
//! | Task | Per channel | Cache |
//! |------|-------------|-------|
//! | `stats_sync` | fetch provider metrics, append a snapshot, update the channel | invalidate `stats:<id>:` |
//! | `snapshot_prune` | delete snapshots older than the retention window | invalidate when rows were removed |
//!
//! Both run through [`TaskRunner`](crate::runner::TaskRunner), so each is
//! guarded by its lock and leaves an execution record. Callers that may be
//! cancelled use [`spawn_task`] so a started batch always runs to the end.

use crate::cache::CacheAside;
use crate::context::AppContext;
use crate::provider::ProviderClient;
use crate::runner::OpRecorder;
use crate::stats::{self, STATS_DOMAIN};
use crate::storage::{Channel, ChannelUpdate, StatsSnapshot, Storage, TaskExecutionRecord, TaskType};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

pub const PRUNE_OP: &str = "prune_snapshots";

/// Run `task` once, outside any schedule.
pub async fn run_task(ctx: &AppContext, task: TaskType) -> Result<TaskExecutionRecord> {
    match task {
        TaskType::StatsSync => stats_sync(ctx).await,
        TaskType::SnapshotPrune => Ok(snapshot_prune(ctx).await),
    }
}

/// Run `task` on its own tokio task.
///
/// Dropping the caller's future (a disconnected client, a timeout) leaves the
/// batch running, so its lock is released and its record written. A panic
/// that escapes the batch comes back as an error.
pub async fn spawn_task(ctx: Arc<AppContext>, task: TaskType) -> Result<TaskExecutionRecord> {
    tokio::spawn(async move { run_task(&ctx, task).await })
        .await
        .map_err(|e| {
            if e.is_panic() {
                anyhow!("{} panicked: {}", task, crate::panic_message(e.into_panic().as_ref()))
            } else {
                anyhow!("{} was cancelled", task)
            }
        })?
}

/// Pull fresh metrics for every channel.
///
/// Errors only when no provider is configured; everything else is reported
/// in the returned record.
pub async fn stats_sync(ctx: &AppContext) -> Result<TaskExecutionRecord> {
    let provider = ctx
        .provider
        .as_ref()
        .ok_or_else(|| anyhow!("stats_sync needs a metrics provider (set PROVIDER_URL)"))?;
    let storage = ctx.store().await;
    let cache = &ctx.cache;

    Ok(ctx
        .runner
        .run(
            TaskType::StatsSync,
            || storage.list_channels(),
            |channel: Channel, ops: OpRecorder| sync_channel(storage, cache, provider, channel, ops),
        )
        .await)
}

async fn sync_channel(
    storage: &Storage,
    cache: &CacheAside,
    provider: &ProviderClient,
    channel: Channel,
    ops: OpRecorder,
) -> Result<()> {
    let metrics = provider
        .fetch_channel_metrics(&channel.external_id, &ops)
        .await?;
    let now = Utc::now();

    storage
        .add_snapshot(&StatsSnapshot {
            channel_id: channel.id.clone(),
            captured_at: now,
            subscribers: metrics.subscribers,
            views: metrics.views,
            videos: metrics.videos,
        })
        .await?;
    stats::update_channel(
        storage,
        cache,
        &channel.id,
        &ChannelUpdate {
            last_synced_at: Some(now),
            subscribers: Some(metrics.subscribers),
            views: Some(metrics.views),
            videos: Some(metrics.videos),
            ..Default::default()
        },
    )
    .await?;
    debug!(channel = %channel.id, subscribers = metrics.subscribers, "channel synced");
    Ok(())
}

/// Delete snapshots older than the configured retention window.
pub async fn snapshot_prune(ctx: &AppContext) -> TaskExecutionRecord {
    let cutoff = retention_cutoff(Utc::now(), ctx.settings.retention.snapshot_days);
    let storage = ctx.store().await;
    let cache = &ctx.cache;

    ctx.runner
        .run(
            TaskType::SnapshotPrune,
            || storage.list_channels(),
            |channel: Channel, ops: OpRecorder| prune_channel(storage, cache, channel, ops, cutoff),
        )
        .await
}

async fn prune_channel(
    storage: &Storage,
    cache: &CacheAside,
    channel: Channel,
    ops: OpRecorder,
    cutoff: DateTime<Utc>,
) -> Result<()> {
    ops.call(PRUNE_OP);
    let removed = storage.prune_snapshots(&channel.id, cutoff).await?;
    if removed > 0 {
        cache.invalidate_entity(STATS_DOMAIN, &channel.id).await;
        debug!(channel = %channel.id, removed, "snapshots pruned");
    }
    Ok(())
}

pub fn retention_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_subtracts_whole_days() {
        let now = DateTime::parse_from_rfc3339("2024-03-31T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let cutoff = retention_cutoff(now, 30);
        assert_eq!(cutoff.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }
}
