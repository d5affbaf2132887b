//! Key-value store contract across backends.
//!
//! The REST backend runs against the in-process mock. The TCP backend runs
//! only when `TEST_REDIS_URL` points at a real server.

mod common;

use channelpulse::kv::{KvBackendKind, KvStore, PrefixDelete, SetOptions};
use mock_services::MockKv;
use std::time::Duration;

macro_rules! require_redis {
    () => {
        match common::test_redis_url() {
            Some(url) => url,
            None => {
                eprintln!("Skipping: TEST_REDIS_URL not set");
                return;
            }
        }
    };
}

/// Behaviour every backend shares. `ns` isolates keys on shared servers.
async fn exercise_contract(kv: &KvStore, ns: &str) {
    let key = |k: &str| format!("{}:{}", ns, k);

    assert_eq!(kv.get(&key("missing")).await.unwrap(), None);

    assert!(kv.set(&key("a"), "1", SetOptions::default()).await.unwrap());
    assert_eq!(kv.get(&key("a")).await.unwrap().as_deref(), Some("1"));
    assert!(kv.set(&key("a"), "2", SetOptions::default()).await.unwrap());
    assert_eq!(kv.get(&key("a")).await.unwrap().as_deref(), Some("2"));

    let nx = SetOptions::nx(Duration::from_secs(30));
    assert!(kv.set(&key("lock"), "first", nx).await.unwrap());
    assert!(!kv.set(&key("lock"), "second", nx).await.unwrap());
    assert_eq!(kv.get(&key("lock")).await.unwrap().as_deref(), Some("first"));

    kv.delete(&key("lock")).await.unwrap();
    kv.delete(&key("lock")).await.unwrap();
    assert!(kv.set(&key("lock"), "third", nx).await.unwrap());
    kv.delete(&key("lock")).await.unwrap();
    kv.delete(&key("a")).await.unwrap();
}

#[tokio::test]
async fn memory_backend_honours_contract() {
    let kv = KvStore::memory();
    assert_eq!(kv.kind(), KvBackendKind::Memory);
    assert!(kv.is_process_local());
    assert!(!kv.supports_prefix_delete());
    exercise_contract(&kv, "t").await;
    assert_eq!(kv.delete_prefix("t:").await.unwrap(), PrefixDelete::Unsupported);
}

#[tokio::test]
async fn rest_backend_honours_contract() {
    let mock = MockKv::start().await;
    let kv = common::rest_kv(&mock.url()).await;
    assert_eq!(kv.kind(), KvBackendKind::Rest);
    assert!(!kv.is_process_local());
    exercise_contract(&kv, "t").await;
    assert!(mock.keys().is_empty());
}

#[tokio::test]
async fn rest_prefix_delete_spans_scan_pages() {
    let mock = MockKv::start().await;
    let kv = common::rest_kv(&mock.url()).await;
    for i in 0..7 {
        kv.set(&format!("stats:c1:{}", i), "x", SetOptions::default())
            .await
            .unwrap();
    }
    for other in ["stats:c10:all", "stats:c2:all", "lock:stats_sync"] {
        kv.set(other, "y", SetOptions::default()).await.unwrap();
    }

    assert_eq!(
        kv.delete_prefix("stats:c1:").await.unwrap(),
        PrefixDelete::Deleted(7)
    );
    assert_eq!(
        mock.keys(),
        vec!["lock:stats_sync", "stats:c10:all", "stats:c2:all"]
    );
    let scans = mock
        .command_names()
        .iter()
        .filter(|c| c.as_str() == "SCAN")
        .count();
    assert!(scans > 1, "expected a multi-page scan, got {}", scans);
}

#[tokio::test]
async fn rest_prefix_with_glob_characters_is_escaped() {
    let mock = MockKv::start().await;
    let kv = common::rest_kv(&mock.url()).await;
    kv.delete_prefix("odd*key:").await.unwrap();
    let scan = mock
        .commands()
        .into_iter()
        .find(|c| c[0] == "SCAN")
        .unwrap();
    assert_eq!(scan[3], "odd\\*key:*");
}

#[tokio::test]
async fn rest_ttl_is_sent_as_whole_seconds() {
    let mock = MockKv::start().await;
    let kv = common::rest_kv(&mock.url()).await;
    kv.set("k", "v", SetOptions::ttl(Duration::from_millis(1500)))
        .await
        .unwrap();
    assert_eq!(mock.commands()[0], vec!["SET", "k", "v", "EX", "2"]);
}

#[tokio::test]
async fn rest_errors_surface_as_errors() {
    let mock = MockKv::start().await;
    mock.set_failing(true);
    let kv = common::rest_kv(&mock.url()).await;
    let err = kv.get("k").await.unwrap_err();
    assert!(format!("{:#}", err).contains("simulated outage"));
    assert!(kv.set("k", "v", SetOptions::default()).await.is_err());
    assert!(kv.delete_prefix("k").await.is_err());
}

#[tokio::test]
async fn token_in_url_password_is_used() {
    let mock = MockKv::start_with_token(Some("tok")).await;
    let url = mock.url().replace("http://", "http://:tok@");
    let kv = KvStore::connect(Some(&url), None).await.unwrap();
    kv.set("k", "v", SetOptions::default()).await.unwrap();
    assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn connect_picks_backend_by_scheme() {
    assert_eq!(
        KvStore::connect(None, None).await.unwrap().kind(),
        KvBackendKind::Memory
    );
    assert_eq!(
        KvStore::connect(Some("  "), None).await.unwrap().kind(),
        KvBackendKind::Memory
    );
    assert_eq!(
        KvStore::connect(Some("https://kv.example.com"), Some("t"))
            .await
            .unwrap()
            .kind(),
        KvBackendKind::Rest
    );
    let err = KvStore::connect(Some("memcached://localhost:11211"), None)
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("unsupported KV_URL scheme"));
}

#[tokio::test]
async fn tcp_backend_honours_contract() {
    let url = require_redis!();
    let kv = KvStore::connect(Some(&url), None).await.unwrap();
    assert_eq!(kv.kind(), KvBackendKind::Tcp);
    let ns = format!("cptest-{}", uuid::Uuid::new_v4().simple());
    exercise_contract(&kv, &ns).await;

    for i in 0..5 {
        kv.set(&format!("{}:stats:{}", ns, i), "x", SetOptions::ttl(Duration::from_secs(60)))
            .await
            .unwrap();
    }
    assert_eq!(
        kv.delete_prefix(&format!("{}:stats:", ns)).await.unwrap(),
        PrefixDelete::Deleted(5)
    );
}
