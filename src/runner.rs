//! # Runner — Sequential Batch Execution with Per-Entity Isolation
//!
//! [`TaskRunner::run`] executes one named batch task over a set of entities:
//!
//! 1. Take the task's advisory lock; if another run holds it, record `skipped`.
//! 2. Enumerate the entities. Failure here is fatal for the batch.
//! 3. Process entities one at a time, with an optional pause between them to
//!    stay under upstream rate limits. Each entity is marked in progress in
//!    storage while it runs; the marker is cleared whatever the outcome.
//! 4. Count successes and failures. One entity's error never stops the batch,
//!    and neither does a panic: it is caught and counted as that entity's
//!    failure, with the panic text as the error.
//! 5. Build the [`TaskExecutionRecord`] and persist it once.
//!
//! | Outcome | `status` | `success` |
//! |---------|----------|-----------|
//! | all entities ok | `succeeded` | true |
//! | some entities failed | `failed` | false |
//! | lock held elsewhere | `skipped` | true |
//! | enumeration or lock store failure | `fatal` | false |
//!
//! Persisting the record is best effort: a storage failure is logged and the
//! record is still returned to the caller.

use crate::lock::{LockError, LockManager, LockOutcome};
use crate::lock_or_recover;
use crate::prom_metrics::{Metrics, TaskLabel, TaskOutcomeLabel, TaskStatusLabel};
use crate::storage::{
    Channel, StorageSelector, TaskExecutionRecord, TaskStatus, TaskType, MAX_TASK_MESSAGE_CHARS,
};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Per-entity errors listed in a record's message.
pub const MAX_LISTED_ERRORS: usize = 5;
/// Length cap for each listed error.
pub const MAX_ERROR_CHARS: usize = 200;

/// Something a batch task iterates over.
pub trait TaskEntity {
    /// Storage id; also the key for the in-progress marker.
    fn entity_id(&self) -> &str;

    /// Name used in logs and record messages.
    fn display_name(&self) -> &str {
        self.entity_id()
    }
}

impl TaskEntity for Channel {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub calls: u32,
    pub retries: u32,
}

/// Call and retry counts per operation name, shared across a batch.
///
/// Per-entity code records each upstream call so the execution record can
/// show how hard the batch leaned on external services.
#[derive(Clone, Default)]
pub struct OpRecorder {
    counts: Arc<Mutex<BTreeMap<String, OpCounts>>>,
}

impl OpRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self, op: &str) {
        lock_or_recover(&self.counts)
            .entry(op.to_string())
            .or_default()
            .calls += 1;
    }

    pub fn retry(&self, op: &str) {
        lock_or_recover(&self.counts)
            .entry(op.to_string())
            .or_default()
            .retries += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<String, OpCounts> {
        lock_or_recover(&self.counts).clone()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Lock TTL; size it well above the slowest expected batch.
    pub lock_ttl: Duration,
    /// Pause between consecutive entities.
    pub entity_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            lock_ttl: Duration::from_secs(900),
            entity_delay: Duration::from_millis(500),
        }
    }
}

/// Counters accumulated while a batch runs.
#[derive(Debug, Default)]
struct Tally {
    total: usize,
    succeeded: u32,
    failed: u32,
    errors: Vec<String>,
}

#[derive(Clone)]
pub struct TaskRunner {
    locks: LockManager,
    storage: Arc<StorageSelector>,
    metrics: Arc<Metrics>,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(
        locks: LockManager,
        storage: Arc<StorageSelector>,
        metrics: Arc<Metrics>,
        config: RunnerConfig,
    ) -> Self {
        TaskRunner {
            locks,
            storage,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `task` over the entities produced by `enumerate`.
    ///
    /// Never fails: every outcome, fatal ones included, ends up in the
    /// returned record.
    pub async fn run<E, En, EnFut, P, PFut>(
        &self,
        task: TaskType,
        enumerate: En,
        per_entity: P,
    ) -> TaskExecutionRecord
    where
        E: TaskEntity,
        En: FnOnce() -> EnFut,
        EnFut: Future<Output = Result<Vec<E>>>,
        P: Fn(E, OpRecorder) -> PFut,
        PFut: Future<Output = Result<()>>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        let ops = OpRecorder::new();
        info!(task = %task, "task started");

        let per_entity = &per_entity;
        let batch_ops = &ops;
        let outcome = self
            .locks
            .run_with_lock(task.lock_name(), self.config.lock_ttl, || async move {
                let entities = enumerate().await.context("enumerating entities")?;
                Ok(self.process(task, entities, per_entity, batch_ops).await)
            })
            .await;

        let (status, success_count, failure_count, message) = match outcome {
            Ok(LockOutcome::Acquired(tally)) => {
                let status = if tally.failed == 0 {
                    TaskStatus::Succeeded
                } else {
                    TaskStatus::Failed
                };
                let message = summarize(task, &tally, &ops.snapshot());
                (status, tally.succeeded, tally.failed, message)
            }
            Ok(LockOutcome::Skipped) => {
                info!(task = %task, "task skipped, lock held by another run");
                let message = format!("skipped: lock '{}' held by another run", task.lock_name());
                (TaskStatus::Skipped, 0, 0, message)
            }
            Err(e) => {
                let kind = if e.downcast_ref::<LockError>().is_some() {
                    "lock failure"
                } else {
                    "batch failed"
                };
                warn!(task = %task, error = %format!("{e:#}"), "task fatal: {}", kind);
                (TaskStatus::Fatal, 0, 0, format!("{}: {:#}", kind, e))
            }
        };

        let elapsed = clock.elapsed();
        let record = TaskExecutionRecord {
            task_type: task,
            started_at,
            finished_at: Utc::now(),
            success: matches!(status, TaskStatus::Succeeded | TaskStatus::Skipped),
            status,
            success_count,
            failure_count,
            message: crate::truncate_chars(&message, MAX_TASK_MESSAGE_CHARS),
            duration_ms: elapsed.as_millis().min(i64::MAX as u128) as i64,
        };

        self.observe(&record, elapsed);
        if let Err(e) = self.storage.get().await.add_task_execution(&record).await {
            warn!(task = %task, error = %format!("{e:#}"), "failed to persist task execution record");
        }
        info!(
            task = %task,
            status = %record.status,
            succeeded = record.success_count,
            failed = record.failure_count,
            duration_ms = record.duration_ms,
            "task finished"
        );
        record
    }

    async fn process<E, P, PFut>(
        &self,
        task: TaskType,
        entities: Vec<E>,
        per_entity: &P,
        ops: &OpRecorder,
    ) -> Tally
    where
        E: TaskEntity,
        P: Fn(E, OpRecorder) -> PFut,
        PFut: Future<Output = Result<()>>,
    {
        let storage = self.storage.get().await;
        let mut tally = Tally {
            total: entities.len(),
            ..Tally::default()
        };

        for (i, entity) in entities.into_iter().enumerate() {
            if i > 0 && !self.config.entity_delay.is_zero() {
                tokio::time::sleep(self.config.entity_delay).await;
            }
            let id = entity.entity_id().to_string();
            let name = entity.display_name().to_string();

            if let Err(e) = storage.set_in_progress(&id, true).await {
                warn!(task = %task, entity = %id, error = %format!("{e:#}"), "failed to set in-progress marker");
            }
            let result = match AssertUnwindSafe(per_entity(entity, ops.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(
                    "panicked: {}",
                    crate::panic_message(panic.as_ref())
                )),
            };
            if let Err(e) = storage.set_in_progress(&id, false).await {
                warn!(task = %task, entity = %id, error = %format!("{e:#}"), "failed to clear in-progress marker");
            }

            match result {
                Ok(()) => tally.succeeded += 1,
                Err(e) => {
                    warn!(task = %task, entity = %id, error = %format!("{e:#}"), "entity failed");
                    tally.failed += 1;
                    tally.errors.push(format!(
                        "{}: {}",
                        name,
                        crate::truncate_chars(&format!("{e:#}"), MAX_ERROR_CHARS)
                    ));
                }
            }
        }
        tally
    }

    fn observe(&self, record: &TaskExecutionRecord, elapsed: Duration) {
        let task = record.task_type.as_str().to_string();
        self.metrics
            .task_runs
            .get_or_create(&TaskStatusLabel {
                task: task.clone(),
                status: record.status.as_str().to_string(),
            })
            .inc();
        for (outcome, n) in [("ok", record.success_count), ("failed", record.failure_count)] {
            if n > 0 {
                self.metrics
                    .task_entities
                    .get_or_create(&TaskOutcomeLabel {
                        task: task.clone(),
                        outcome: outcome.to_string(),
                    })
                    .inc_by(n as u64);
            }
        }
        self.metrics
            .task_last_duration
            .get_or_create(&TaskLabel { task })
            .set(elapsed.as_secs_f64());
    }
}

/// Human-readable summary: counts, op counts, then the first few errors.
fn summarize(task: TaskType, tally: &Tally, ops: &BTreeMap<String, OpCounts>) -> String {
    let mut msg = format!(
        "{}: {} of {} succeeded, {} failed",
        task, tally.succeeded, tally.total, tally.failed
    );
    if !ops.is_empty() {
        let parts: Vec<String> = ops
            .iter()
            .map(|(op, c)| format!("{}={} calls/{} retries", op, c.calls, c.retries))
            .collect();
        msg.push_str("; ops: ");
        msg.push_str(&parts.join(", "));
    }
    if !tally.errors.is_empty() {
        msg.push_str("; errors: ");
        let listed: Vec<&str> = tally
            .errors
            .iter()
            .take(MAX_LISTED_ERRORS)
            .map(String::as_str)
            .collect();
        msg.push_str(&listed.join("; "));
        if tally.errors.len() > MAX_LISTED_ERRORS {
            msg.push_str(&format!(" (+{} more)", tally.errors.len() - MAX_LISTED_ERRORS));
        }
    }
    msg
}
