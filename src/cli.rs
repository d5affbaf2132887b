//! Subcommand handlers. Each builds its own [`AppContext`] from the merged
//! settings; output goes to stdout, logs to stderr.

use crate::ChannelAction;
use anyhow::{bail, Result};
use channelpulse::config::Settings;
use channelpulse::context::AppContext;
use channelpulse::storage::{ChannelUpdate, NewChannel, TaskExecutionRecord, TaskStatus, TaskType};
use channelpulse::{scheduler, server, stats, tasks};
use chrono::NaiveDate;
use tracing::info;

pub async fn run_serve(settings: Settings, port: u16) -> Result<()> {
    let ctx = AppContext::init(settings).await?;
    let storage = ctx.store().await;
    info!(storage = %storage.kind(), kv = %ctx.kv.kind(), "backends selected");
    let loops = scheduler::spawn(ctx.clone());
    let result = server::serve(ctx, port).await;
    for handle in loops {
        handle.abort();
    }
    result
}

pub async fn run_task(settings: Settings, task: &str) -> Result<()> {
    let task: TaskType = task.parse()?;
    let ctx = AppContext::init(settings).await?;
    let record = tasks::run_task(&ctx, task).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    match record.status {
        TaskStatus::Succeeded | TaskStatus::Skipped => Ok(()),
        TaskStatus::Failed | TaskStatus::Fatal => bail!("{} {}: {}", task, record.status, record.message),
    }
}

pub async fn run_backend(settings: Settings) -> Result<()> {
    let ctx = AppContext::init(settings).await?;
    let storage = ctx.store().await;
    println!("storage: {}", storage.kind());
    println!("kv: {}", ctx.kv.kind());
    if !storage.is_durable() {
        println!("warning: storage is in-memory; data is lost on exit");
    }
    if ctx.kv.is_process_local() {
        println!("warning: kv store is process-local; task locks do not span processes");
    }
    Ok(())
}

pub async fn run_channels(settings: Settings, action: &ChannelAction) -> Result<()> {
    let ctx = AppContext::init(settings).await?;
    let storage = ctx.store().await;
    match action {
        ChannelAction::Add {
            name,
            external_id,
            timezone,
        } => {
            let channel = storage
                .add_channel(&NewChannel {
                    name: name.clone(),
                    external_id: external_id.clone(),
                    timezone: timezone.clone(),
                })
                .await?;
            println!("added {} ({})", channel.id, channel.name);
        }
        ChannelAction::List => {
            let channels = storage.list_channels().await?;
            if channels.is_empty() {
                println!("no channels");
            }
            for c in channels {
                let synced = c
                    .last_synced_at
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  {:<24} {:<24} {:<20} subs={} synced={}",
                    c.id,
                    c.name,
                    c.external_id,
                    c.timezone,
                    c.subscribers.map_or("-".to_string(), |n| n.to_string()),
                    synced
                );
            }
        }
        ChannelAction::Update { id, name, timezone } => {
            if name.is_none() && timezone.is_none() {
                bail!("nothing to update: pass --name and/or --timezone");
            }
            let update = ChannelUpdate {
                name: name.clone(),
                timezone: timezone.clone(),
                ..ChannelUpdate::default()
            };
            let Some(channel) = stats::update_channel(storage, &ctx.cache, id, &update).await? else {
                bail!("channel '{}' not found", id);
            };
            println!("updated {} ({}, {})", channel.id, channel.name, channel.timezone);
        }
        ChannelAction::Remove { id } => {
            if !stats::remove_channel(storage, &ctx.cache, id).await? {
                bail!("channel '{}' not found", id);
            }
            println!("removed {}", id);
        }
    }
    Ok(())
}

pub async fn run_history(settings: Settings, limit: usize) -> Result<()> {
    let ctx = AppContext::init(settings).await?;
    let records = ctx.store().await.list_task_executions(limit).await?;
    if records.is_empty() {
        println!("no task executions");
    }
    for r in &records {
        println!("{}", format_record(r));
    }
    Ok(())
}

fn format_record(r: &TaskExecutionRecord) -> String {
    format!(
        "{}  {:<15} {:<10} ok={} failed={} {}ms  {}",
        r.started_at.format("%Y-%m-%d %H:%M:%S"),
        r.task_type,
        r.status,
        r.success_count,
        r.failure_count,
        r.duration_ms,
        r.message
    )
}

pub async fn run_stats(
    settings: Settings,
    channel: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<()> {
    let ctx = AppContext::init(settings).await?;
    let storage = ctx.store().await;
    let days = stats::daily_stats(
        storage,
        &ctx.cache,
        ctx.settings.stats_ttl(),
        channel,
        start,
        end,
    )
    .await?;
    if days.is_empty() {
        println!("no snapshots");
    }
    for d in days {
        println!(
            "{}  subscribers={} views={} videos={}",
            d.day, d.subscribers, d.views, d.videos
        );
    }
    Ok(())
}
