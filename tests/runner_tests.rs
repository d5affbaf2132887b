//! Task runner: isolation, ordering, markers, records.

mod common;

use anyhow::{anyhow, bail};
use channelpulse::kv::{KvStore, SetOptions};
use channelpulse::lock::LockManager;
use channelpulse::prom_metrics::Metrics;
use channelpulse::runner::{OpRecorder, RunnerConfig, TaskEntity, TaskRunner};
use channelpulse::storage::{
    Channel, MemoryStorage, Storage, StorageSelector, TaskStatus, TaskType, MAX_TASK_MESSAGE_CHARS,
};
use mock_services::MockKv;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Item(String);

impl TaskEntity for Item {
    fn entity_id(&self) -> &str {
        &self.0
    }
}

fn items(n: usize) -> Vec<Item> {
    (0..n).map(|i| Item(format!("item-{}", i))).collect()
}

fn runner_with(kv: KvStore, delay: Duration) -> (TaskRunner, Arc<StorageSelector>, Arc<Metrics>) {
    let storage = Arc::new(StorageSelector::with_storage(Storage::Memory(MemoryStorage::new())));
    let metrics = Arc::new(Metrics::new());
    let runner = TaskRunner::new(
        LockManager::new(kv),
        storage.clone(),
        metrics.clone(),
        RunnerConfig {
            lock_ttl: Duration::from_secs(60),
            entity_delay: delay,
        },
    );
    (runner, storage, metrics)
}

fn runner() -> (TaskRunner, Arc<StorageSelector>, Arc<Metrics>) {
    runner_with(KvStore::memory(), Duration::ZERO)
}

#[tokio::test]
async fn failures_are_isolated_and_every_entity_is_visited() {
    let (runner, storage, _) = runner();
    let visited = Mutex::new(Vec::new());

    let record = runner
        .run(
            TaskType::StatsSync,
            || async { Ok(items(10)) },
            |item: Item, _ops: OpRecorder| {
                visited.lock().unwrap().push(item.0.clone());
                async move {
                    let n: usize = item.0.trim_start_matches("item-").parse()?;
                    if n % 3 == 0 {
                        bail!("upstream rejected {}", item.0);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await;

    // items 0, 3, 6, 9 fail
    assert_eq!(record.success_count, 6);
    assert_eq!(record.failure_count, 4);
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(!record.success);
    assert_eq!(visited.lock().unwrap().len(), 10);
    assert_eq!(visited.lock().unwrap()[0], "item-0");
    assert!(record.message.contains("6 of 10 succeeded, 4 failed"));
    assert!(record.message.contains("item-3: upstream rejected item-3"));

    let stored = storage.get().await.list_task_executions(10).await.unwrap();
    assert_eq!(stored, vec![record]);
}

#[tokio::test]
async fn all_ok_is_succeeded_and_ops_are_reported() {
    let (runner, _, metrics) = runner();
    let record = runner
        .run(
            TaskType::SnapshotPrune,
            || async { Ok(items(3)) },
            |_item: Item, ops: OpRecorder| async move {
                ops.call("fetch");
                ops.retry("fetch");
                Ok(())
            },
        )
        .await;
    assert_eq!(record.status, TaskStatus::Succeeded);
    assert!(record.success);
    assert_eq!(record.success_count, 3);
    assert!(record.message.contains("fetch=3 calls/3 retries"));
    assert!(record.finished_at >= record.started_at);

    let encoded = metrics.encode();
    assert!(encoded.contains("snapshot_prune"));
    assert!(encoded.contains("succeeded"));
}

#[tokio::test]
async fn entities_are_processed_one_at_a_time() {
    let (runner, _, _) = runner();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    runner
        .run(
            TaskType::StatsSync,
            || async { Ok(items(5)) },
            |_item: Item, _ops: OpRecorder| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn in_progress_marker_is_set_during_and_cleared_after() {
    let storage = Storage::Memory(MemoryStorage::new());
    let ok = common::add_channel(&storage, "Ok", "UC1", "UTC").await;
    let bad = common::add_channel(&storage, "Bad", "UC2", "UTC").await;
    let selector = Arc::new(StorageSelector::with_storage(storage));
    let runner = TaskRunner::new(
        LockManager::new(KvStore::memory()),
        selector.clone(),
        Arc::new(Metrics::new()),
        RunnerConfig {
            lock_ttl: Duration::from_secs(60),
            entity_delay: Duration::ZERO,
        },
    );
    let store = selector.get().await;
    let seen_syncing = Mutex::new(Vec::new());

    let record = runner
        .run(
            TaskType::StatsSync,
            || store.list_channels(),
            |ch: Channel, _ops: OpRecorder| {
                let seen = &seen_syncing;
                async move {
                    let current = store.get_channel(&ch.id).await?.unwrap();
                    seen.lock().unwrap().push(current.syncing);
                    if ch.name == "Bad" {
                        return Err(anyhow!("boom"));
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await;

    assert_eq!(record.failure_count, 1);
    assert_eq!(*seen_syncing.lock().unwrap(), vec![true, true]);
    for id in [&ok.id, &bad.id] {
        assert!(!store.get_channel(id).await.unwrap().unwrap().syncing);
    }
}

#[tokio::test]
async fn panicking_entity_is_a_failure_and_the_batch_finishes() {
    let storage = Storage::Memory(MemoryStorage::new());
    let calm = common::add_channel(&storage, "Calm", "UC1", "UTC").await;
    let wild = common::add_channel(&storage, "Wild", "UC2", "UTC").await;
    let selector = Arc::new(StorageSelector::with_storage(storage));
    let locks = LockManager::new(KvStore::memory());
    let runner = TaskRunner::new(
        locks.clone(),
        selector.clone(),
        Arc::new(Metrics::new()),
        RunnerConfig {
            lock_ttl: Duration::from_secs(60),
            entity_delay: Duration::ZERO,
        },
    );
    let store = selector.get().await;
    let visited = AtomicUsize::new(0);

    let record = runner
        .run(
            TaskType::StatsSync,
            || store.list_channels(),
            |ch: Channel, _ops: OpRecorder| {
                let visited = &visited;
                async move {
                    visited.fetch_add(1, Ordering::SeqCst);
                    if ch.name == "Wild" {
                        panic!("decoder exploded on {}", ch.external_id);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await;

    assert_eq!(visited.load(Ordering::SeqCst), 2);
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.success_count, 1);
    assert_eq!(record.failure_count, 1);
    assert!(record.message.contains("Wild: panicked: decoder exploded on UC2"));
    for id in [&calm.id, &wild.id] {
        assert!(!store.get_channel(id).await.unwrap().unwrap().syncing);
    }
    assert!(!locks.is_held(TaskType::StatsSync.lock_name()).await.unwrap());
    assert_eq!(store.list_task_executions(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn held_lock_records_skipped_without_running() {
    let kv = KvStore::memory();
    kv.set(
        &LockManager::key_for(TaskType::StatsSync.lock_name()),
        "other-process",
        SetOptions::nx(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let (runner, storage, _) = runner_with(kv, Duration::ZERO);
    let enumerated = AtomicUsize::new(0);

    let record = runner
        .run(
            TaskType::StatsSync,
            || async {
                enumerated.fetch_add(1, Ordering::SeqCst);
                Ok(items(3))
            },
            |_item: Item, _ops: OpRecorder| async { Ok(()) },
        )
        .await;

    assert_eq!(record.status, TaskStatus::Skipped);
    assert!(record.success);
    assert_eq!(record.success_count + record.failure_count, 0);
    assert_eq!(enumerated.load(Ordering::SeqCst), 0);
    assert_eq!(
        storage.get().await.list_task_executions(5).await.unwrap()[0].status,
        TaskStatus::Skipped
    );
}

#[tokio::test]
async fn enumeration_failure_is_fatal_and_releases_lock() {
    let kv = KvStore::memory();
    let (runner, _, _) = runner_with(kv.clone(), Duration::ZERO);
    let record = runner
        .run(
            TaskType::StatsSync,
            || async { Err::<Vec<Item>, _>(anyhow!("connection refused")) },
            |_item: Item, _ops: OpRecorder| async { Ok(()) },
        )
        .await;
    assert_eq!(record.status, TaskStatus::Fatal);
    assert!(!record.success);
    assert!(record.message.contains("enumerating entities"));
    assert!(record.message.contains("connection refused"));
    assert!(!LockManager::new(kv).is_held("stats_sync").await.unwrap());
}

#[tokio::test]
async fn lock_store_outage_is_fatal() {
    let mock = MockKv::start().await;
    mock.set_failing(true);
    let (runner, _, _) = runner_with(common::rest_kv(&mock.url()).await, Duration::ZERO);
    let record = runner
        .run(
            TaskType::SnapshotPrune,
            || async { Ok(items(2)) },
            |_item: Item, _ops: OpRecorder| async { Ok(()) },
        )
        .await;
    assert_eq!(record.status, TaskStatus::Fatal);
    assert!(record.message.starts_with("lock failure"));
}

#[tokio::test]
async fn long_errors_are_capped_in_the_message() {
    let (runner, _, _) = runner();
    let record = runner
        .run(
            TaskType::StatsSync,
            || async { Ok(items(20)) },
            |_item: Item, _ops: OpRecorder| async { Err(anyhow!("x".repeat(5_000))) },
        )
        .await;
    assert_eq!(record.failure_count, 20);
    assert_eq!(record.message.chars().count(), MAX_TASK_MESSAGE_CHARS);
    assert!(record.message.ends_with("..."));
}

#[tokio::test]
async fn only_the_first_errors_are_listed() {
    let (runner, _, _) = runner();
    let record = runner
        .run(
            TaskType::StatsSync,
            || async { Ok(items(20)) },
            |item: Item, _ops: OpRecorder| async move { Err(anyhow!("{} timed out", item.0)) },
        )
        .await;
    assert!(record.message.contains("item-4: item-4 timed out"));
    assert!(!record.message.contains("item-5 timed out"));
    assert!(record.message.ends_with("(+15 more)"));
}

#[tokio::test(start_paused = true)]
async fn delay_is_inserted_between_entities_only() {
    let (runner, _, _) = runner_with(KvStore::memory(), Duration::from_secs(2));
    let start = tokio::time::Instant::now();
    runner
        .run(
            TaskType::StatsSync,
            || async { Ok(items(3)) },
            |_item: Item, _ops: OpRecorder| async { Ok(()) },
        )
        .await;
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(4));
    assert!(waited < Duration::from_secs(6));
}
