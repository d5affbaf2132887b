//! Interval-driven triggers for the batch tasks.
//!
//! One background loop per enabled task. Loops in several processes may fire
//! at the same moment; the task lock lets one run through and records the
//! others as skipped.

use crate::context::AppContext;
use crate::storage::TaskType;
use crate::tasks;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Tasks that get a loop, with their intervals.
///
/// A zero interval disables a task. `stats_sync` is left out when no
/// provider is configured.
pub fn scheduled_tasks(ctx: &AppContext) -> Vec<(TaskType, Duration)> {
    let schedule = &ctx.settings.schedule;
    let mut out = Vec::new();
    if schedule.stats_sync_interval_secs > 0 {
        if ctx.provider.is_some() {
            out.push((
                TaskType::StatsSync,
                Duration::from_secs(schedule.stats_sync_interval_secs),
            ));
        } else {
            warn!("scheduler: no metrics provider configured, stats_sync not scheduled");
        }
    }
    if schedule.snapshot_prune_interval_secs > 0 {
        out.push((
            TaskType::SnapshotPrune,
            Duration::from_secs(schedule.snapshot_prune_interval_secs),
        ));
    }
    out
}

/// Spawn one loop per scheduled task. The first run happens one interval
/// after start-up. Each run gets its own task, so a panicking run is logged
/// and the loop carries on.
pub fn spawn(ctx: Arc<AppContext>) -> Vec<JoinHandle<()>> {
    scheduled_tasks(&ctx)
        .into_iter()
        .map(|(task, every)| {
            let ctx = Arc::clone(&ctx);
            info!(task = %task, interval_secs = every.as_secs(), "scheduler: task scheduled");
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match tasks::spawn_task(Arc::clone(&ctx), task).await {
                        Ok(record) => info!(
                            task = %task,
                            status = %record.status,
                            "scheduler: run complete"
                        ),
                        Err(e) => warn!(task = %task, error = %format!("{e:#}"), "scheduler: run failed"),
                    }
                }
            })
        })
        .collect()
}
