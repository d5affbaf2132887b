//! PostgreSQL storage via `sqlx::PgPool`.
//!
//! The schema in `migrations/001_channelpulse.sql` is applied with
//! `CREATE ... IF NOT EXISTS` on connect, so a fresh database works without a
//! separate migration step.

use super::{
    Channel, ChannelUpdate, NewChannel, StatsSnapshot, TaskExecutionRecord, MAX_TASK_MESSAGE_CHARS,
};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;

const SCHEMA: &str = include_str!("../../migrations/001_channelpulse.sql");

const CHANNEL_COLUMNS: &str = "id, name, external_id, timezone, syncing, last_synced_at,
     subscribers, views, videos, created_at";

#[derive(sqlx::FromRow)]
struct TaskExecutionRow {
    task_type: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    success: bool,
    status: String,
    success_count: i32,
    failure_count: i32,
    message: String,
    duration_ms: i64,
}

impl TryFrom<TaskExecutionRow> for TaskExecutionRecord {
    type Error = anyhow::Error;

    fn try_from(row: TaskExecutionRow) -> Result<Self> {
        Ok(TaskExecutionRecord {
            task_type: row.task_type.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            success: row.success,
            status: row.status.parse()?,
            success_count: row.success_count.max(0) as u32,
            failure_count: row.failure_count.max(0) as u32,
            message: row.message,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect, verify with `SELECT 1`, and ensure the schema exists.
    ///
    /// Parses the URL by hand to keep the full username; poolers that route
    /// on a `user.project-ref` username break under sqlx's own parser.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(acquire_timeout)
            .connect_with(opts)
            .await?;
        let storage = PgStorage { pool };
        storage.health_check().await?;
        sqlx::raw_sql(SCHEMA).execute(&storage.pool).await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY created_at, name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn add_channel(&self, new: &NewChannel) -> Result<Channel> {
        let id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query_as::<_, Channel>(&format!(
            "INSERT INTO channels (id, name, external_id, timezone)
             VALUES ($1, $2, $3, $4)
             RETURNING {CHANNEL_COLUMNS}"
        ))
        .bind(&id)
        .bind(&new.name)
        .bind(&new.external_id)
        .bind(&new.timezone)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(channel) => Ok(channel),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                bail!("channel with external id '{}' already exists", new.external_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_channel(&self, id: &str, update: &ChannelUpdate) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, Channel>(&format!(
            "UPDATE channels SET
                name = COALESCE($2, name),
                timezone = COALESCE($3, timezone),
                last_synced_at = COALESCE($4, last_synced_at),
                subscribers = COALESCE($5, subscribers),
                views = COALESCE($6, views),
                videos = COALESCE($7, videos)
             WHERE id = $1
             RETURNING {CHANNEL_COLUMNS}"
        ))
        .bind(id)
        .bind(&update.name)
        .bind(&update.timezone)
        .bind(update.last_synced_at)
        .bind(update.subscribers)
        .bind(update.views)
        .bind(update.videos)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_channel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channels WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_in_progress(&self, id: &str, in_progress: bool) -> Result<()> {
        sqlx::query("UPDATE channels SET syncing = $2 WHERE id = $1")
            .bind(id)
            .bind(in_progress)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM app_config WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_config (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_snapshot(&self, snapshot: &StatsSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO stats_snapshots (channel_id, captured_at, subscribers, views, videos)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&snapshot.channel_id)
        .bind(snapshot.captured_at)
        .bind(snapshot.subscribers)
        .bind(snapshot.views)
        .bind(snapshot.videos)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_snapshots(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatsSnapshot>> {
        let rows = sqlx::query_as::<_, StatsSnapshot>(
            "SELECT channel_id, captured_at, subscribers, views, videos
             FROM stats_snapshots
             WHERE channel_id = $1
               AND ($2::TIMESTAMPTZ IS NULL OR captured_at >= $2)
               AND ($3::TIMESTAMPTZ IS NULL OR captured_at < $3)
             ORDER BY captured_at",
        )
        .bind(channel_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn prune_snapshots(&self, channel_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM stats_snapshots WHERE channel_id = $1 AND captured_at < $2")
                .bind(channel_id)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn add_task_execution(&self, record: &TaskExecutionRecord) -> Result<()> {
        let message = crate::truncate_chars(&record.message, MAX_TASK_MESSAGE_CHARS);
        sqlx::query(
            "INSERT INTO task_executions
                (task_type, started_at, finished_at, success, status,
                 success_count, failure_count, message, duration_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.task_type.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.success)
        .bind(record.status.as_str())
        .bind(i32::try_from(record.success_count).map_err(|_| anyhow!("success_count overflow"))?)
        .bind(i32::try_from(record.failure_count).map_err(|_| anyhow!("failure_count overflow"))?)
        .bind(message)
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_task_executions(&self, limit: usize) -> Result<Vec<TaskExecutionRecord>> {
        let rows = sqlx::query_as::<_, TaskExecutionRow>(
            "SELECT task_type, started_at, finished_at, success, status,
                    success_count, failure_count, message, duration_ms
             FROM task_executions ORDER BY started_at DESC, id DESC LIMIT $1",
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskExecutionRecord::try_from).collect()
    }
}
