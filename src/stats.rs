//! Per-day channel statistics, served through the cache.
//!
//! A channel's snapshots are reduced to the last one of each local calendar
//! day in the channel's timezone. Results are cached under
//! `stats:<channel_id>:<start|all>:<end|all>`.
//!
//! Channel mutations that change what a read returns (counts, timezone,
//! removal) go through [`update_channel`] and [`remove_channel`], which clear
//! the channel's `stats:<channel_id>:` namespace after the write.

use crate::cache::{cache_key, CacheAside};
use crate::daybucket;
use crate::storage::{Channel, ChannelUpdate, Storage};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const STATS_DOMAIN: &str = "stats";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub day: NaiveDate,
    pub subscribers: i64,
    pub views: i64,
    pub videos: i64,
    /// When the snapshot that represents this day was taken.
    pub captured_at: DateTime<Utc>,
}

/// Daily stats for `channel_id` over the inclusive local-day range.
///
/// Errors if the channel does not exist; the error is not cached.
pub async fn daily_stats(
    storage: &Storage,
    cache: &CacheAside,
    ttl: Duration,
    channel_id: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<DailyStat>> {
    let key = cache_key(STATS_DOMAIN, channel_id, start, end);
    cache
        .get_or_compute(&key, ttl, || compute_daily_stats(storage, channel_id, start, end))
        .await
}

/// Apply `update` to a channel and drop its cached stats.
///
/// Returns `None` when the channel does not exist.
pub async fn update_channel(
    storage: &Storage,
    cache: &CacheAside,
    channel_id: &str,
    update: &ChannelUpdate,
) -> Result<Option<Channel>> {
    let updated = storage.update_channel(channel_id, update).await?;
    if updated.is_some() {
        cache.invalidate_entity(STATS_DOMAIN, channel_id).await;
    }
    Ok(updated)
}

/// Delete a channel with its snapshots and drop its cached stats.
pub async fn remove_channel(storage: &Storage, cache: &CacheAside, channel_id: &str) -> Result<bool> {
    let existed = storage.delete_channel(channel_id).await?;
    if existed {
        cache.invalidate_entity(STATS_DOMAIN, channel_id).await;
    }
    Ok(existed)
}

/// Uncached computation behind [`daily_stats`].
pub async fn compute_daily_stats(
    storage: &Storage,
    channel_id: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<DailyStat>> {
    let channel = storage
        .get_channel(channel_id)
        .await?
        .ok_or_else(|| anyhow!("channel '{}' not found", channel_id))?;
    let tz = daybucket::resolve_timezone(&channel.timezone);

    let since = start.map(|d| daybucket::day_start_utc(d, tz));
    let until = end.map(|d| daybucket::day_range_utc(d, tz).1);
    let snapshots = storage.list_snapshots(channel_id, since, until).await?;

    Ok(daybucket::last_per_day(snapshots, tz, |s| s.captured_at)
        .into_iter()
        .map(|(day, s)| DailyStat {
            day,
            subscribers: s.subscribers,
            views: s.views,
            videos: s.videos,
            captured_at: s.captured_at,
        })
        .collect())
}
