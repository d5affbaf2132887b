//! Lock manager behaviour against the process-local store and the REST mock.

mod common;

use anyhow::anyhow;
use channelpulse::kv::{KvStore, SetOptions};
use channelpulse::lock::{LockError, LockManager, LockOutcome, LockPhase};
use mock_services::MockKv;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Barrier};

#[tokio::test]
async fn concurrent_runs_exactly_one_executes() {
    let locks = LockManager::new(KvStore::memory());
    let ran = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let locks = locks.clone();
        let ran = ran.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            locks
                .run_with_lock("sync_42", Duration::from_secs(5), || async {
                    ran.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .await
                .unwrap()
        }));
    }

    let mut skipped = 0;
    for h in handles {
        if h.await.unwrap().is_skipped() {
            skipped += 1;
        }
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(skipped, 1);
}

#[tokio::test]
async fn second_run_is_skipped_immediately_while_first_holds() {
    let locks = LockManager::new(KvStore::memory());
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = {
        let locks = locks.clone();
        tokio::spawn(async move {
            locks
                .run_with_lock("sync_42", Duration::from_secs(5), || async move {
                    entered_tx.send(()).unwrap();
                    release_rx.await.ok();
                    Ok("first")
                })
                .await
                .unwrap()
        })
    };
    entered_rx.await.unwrap();

    let second = tokio::time::timeout(
        Duration::from_millis(500),
        locks.run_with_lock("sync_42", Duration::from_secs(5), || async {
            Ok("second")
        }),
    )
    .await
    .expect("contended lock must not wait")
    .unwrap();
    assert_eq!(second, LockOutcome::Skipped);

    release_tx.send(()).unwrap();
    assert_eq!(holder.await.unwrap(), LockOutcome::Acquired("first"));

    let third = locks
        .run_with_lock("sync_42", Duration::from_secs(5), || async { Ok("third") })
        .await
        .unwrap();
    assert_eq!(third, LockOutcome::Acquired("third"));
}

#[tokio::test(start_paused = true)]
async fn abandoned_lock_is_reacquirable_after_ttl() {
    let kv = KvStore::memory();
    let locks = LockManager::new(kv.clone());
    // A holder that crashed without releasing.
    assert!(kv
        .set(&LockManager::key_for("prune"), "dead-holder", SetOptions::nx(Duration::from_secs(5)))
        .await
        .unwrap());

    let out = locks
        .run_with_lock("prune", Duration::from_secs(5), || async { Ok(()) })
        .await
        .unwrap();
    assert!(out.is_skipped());

    tokio::time::advance(Duration::from_secs(6)).await;
    let out = locks
        .run_with_lock("prune", Duration::from_secs(5), || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(out, LockOutcome::Acquired(()));
}

#[tokio::test]
async fn different_lock_names_do_not_contend() {
    let locks = LockManager::new(KvStore::memory());
    let inner = locks.clone();
    let out = locks
        .run_with_lock("a", Duration::from_secs(5), || async move {
            inner
                .run_with_lock("b", Duration::from_secs(5), || async { Ok(1) })
                .await
        })
        .await
        .unwrap();
    assert_eq!(out, LockOutcome::Acquired(LockOutcome::Acquired(1)));
}

#[tokio::test]
async fn process_local_stores_do_not_exclude_each_other() {
    // Two processes each falling back to their own memory store: both run.
    let a = LockManager::new(KvStore::memory());
    let b = LockManager::new(KvStore::memory());
    let inner = b.clone();
    let out = a
        .run_with_lock("sync", Duration::from_secs(5), || async move {
            inner
                .run_with_lock("sync", Duration::from_secs(5), || async { Ok(()) })
                .await
        })
        .await
        .unwrap();
    assert_eq!(out, LockOutcome::Acquired(LockOutcome::Acquired(())));
    assert!(KvStore::memory().is_process_local());
}

#[tokio::test]
async fn shared_rest_store_excludes_across_managers() {
    let mock = MockKv::start().await;
    let a = LockManager::new(common::rest_kv(&mock.url()).await);
    let b = LockManager::new(common::rest_kv(&mock.url()).await);

    let inner = b.clone();
    let out = a
        .run_with_lock("sync", Duration::from_secs(30), || async move {
            inner
                .run_with_lock("sync", Duration::from_secs(30), || async { Ok(()) })
                .await
        })
        .await
        .unwrap();
    assert_eq!(out, LockOutcome::Acquired(LockOutcome::Skipped));
    assert!(mock.keys().is_empty(), "lock must be released");

    let set = mock
        .commands()
        .into_iter()
        .find(|c| c[0] == "SET")
        .unwrap();
    assert_eq!(set[1], "lock:sync");
    assert_eq!(&set[3..], ["NX", "EX", "30"]);
}

#[tokio::test]
async fn lock_released_when_closure_fails() {
    let mock = MockKv::start().await;
    let locks = LockManager::new(common::rest_kv(&mock.url()).await);
    let err = locks
        .run_with_lock("sync", Duration::from_secs(30), || async {
            Err::<(), _>(anyhow!("provider exploded"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "provider exploded");
    assert!(mock.keys().is_empty());
    assert_eq!(mock.command_names(), vec!["SET", "DEL"]);
}

#[tokio::test]
async fn store_outage_on_acquire_is_a_lock_error() {
    let mock = MockKv::start().await;
    mock.set_failing(true);
    let locks = LockManager::new(common::rest_kv(&mock.url()).await);
    let ran = AtomicUsize::new(0);

    let err = locks
        .run_with_lock("sync", Duration::from_secs(30), || async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    let lock_err = err.downcast_ref::<LockError>().expect("typed lock error");
    assert_eq!(lock_err.phase, LockPhase::Acquire);
    assert_eq!(lock_err.lock, "sync");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bearer_token_is_sent_to_rest_store() {
    let mock = MockKv::start_with_token(Some("s3cret")).await;

    let unauthenticated = LockManager::new(common::rest_kv(&mock.url()).await);
    assert!(unauthenticated
        .run_with_lock("x", Duration::from_secs(5), || async { Ok(()) })
        .await
        .is_err());

    let kv = KvStore::connect(Some(&mock.url()), Some("s3cret")).await.unwrap();
    let locks = LockManager::new(kv);
    let out = locks
        .run_with_lock("x", Duration::from_secs(5), || async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(out, LockOutcome::Acquired(()));
}
