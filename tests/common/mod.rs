//! Shared test helpers for integration tests.

#![allow(dead_code)]

use channelpulse::config::Settings;
use channelpulse::context::AppContext;
use channelpulse::kv::KvStore;
use channelpulse::provider::{ProviderClient, ProviderConfig};
use channelpulse::storage::{Channel, MemoryStorage, NewChannel, Storage};
use std::sync::Arc;
use std::time::Duration;

/// Returns the test database URL from `TEST_DATABASE_URL`, if set.
pub fn test_db_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok().filter(|u| !u.is_empty())
}

pub fn has_test_db() -> bool {
    test_db_url().is_some()
}

/// Returns the test Redis URL from `TEST_REDIS_URL`, if set.
pub fn test_redis_url() -> Option<String> {
    std::env::var("TEST_REDIS_URL").ok().filter(|u| !u.is_empty())
}

pub fn has_test_redis() -> bool {
    test_redis_url().is_some()
}

/// Settings tuned for tests: no pause between entities.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.tasks.entity_delay_ms = 0;
    settings
}

/// A REST KV store pointed at a running mock.
pub async fn rest_kv(url: &str) -> KvStore {
    KvStore::connect(Some(url), None)
        .await
        .expect("mock KV url should be accepted")
}

/// Provider client with short backoff so retry tests stay fast.
pub fn fast_provider(url: &str) -> ProviderClient {
    let mut config = ProviderConfig::new(url::Url::parse(url).unwrap());
    config.initial_backoff = Duration::from_millis(10);
    ProviderClient::new(config).unwrap()
}

/// Context over in-memory storage and the given KV store.
pub fn memory_context(kv: KvStore, provider: Option<ProviderClient>) -> Arc<AppContext> {
    AppContext::from_parts(
        test_settings(),
        kv,
        Storage::Memory(MemoryStorage::new()),
        provider,
    )
}

pub async fn add_channel(storage: &Storage, name: &str, external_id: &str, tz: &str) -> Channel {
    storage
        .add_channel(&NewChannel {
            name: name.to_string(),
            external_id: external_id.to_string(),
            timezone: tz.to_string(),
        })
        .await
        .unwrap()
}
