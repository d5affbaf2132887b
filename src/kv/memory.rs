//! Process-local key-value store.
//!
//! A `HashMap` behind a mutex with monotonic expiry times. Expired entries are
//! dropped lazily on access and by a background sweep that holds only a weak
//! reference, so the sweep task ends once the last store handle is dropped.
//!
//! Expiry uses `tokio::time::Instant`, which makes TTL behaviour testable with
//! a paused clock.

use super::SetOptions;
use crate::lock_or_recover;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Map = Mutex<HashMap<String, Entry>>;

#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Map>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store. When called inside a Tokio runtime the periodic
    /// sweep is started; outside one, expiry is purely lazy.
    pub fn new() -> Self {
        let entries = Arc::new(Mutex::new(HashMap::new()));
        if tokio::runtime::Handle::try_current().is_ok() {
            spawn_sweeper(Arc::downgrade(&entries));
        }
        MemoryStore { entries }
    }

    /// The whole check-and-write happens under one mutex guard, which is what
    /// makes `only_if_absent` atomic.
    pub fn set(&self, key: &str, value: &str, opts: SetOptions) -> bool {
        let now = Instant::now();
        let mut map = lock_or_recover(&self.entries);
        if opts.only_if_absent {
            if let Some(existing) = map.get(key) {
                if existing.is_live(now) {
                    return false;
                }
            }
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: opts.ttl.map(|ttl| now + ttl),
            },
        );
        true
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut map = lock_or_recover(&self.entries);
        match map.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn delete(&self, key: &str) {
        lock_or_recover(&self.entries).remove(key);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn stored_len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }
}

fn sweep(map: &Map) -> usize {
    let now = Instant::now();
    let mut map = lock_or_recover(map);
    let before = map.len();
    map.retain(|_, entry| entry.is_live(now));
    before - map.len()
}

fn spawn_sweeper(entries: Weak<Map>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(map) = entries.upgrade() else {
                break;
            };
            let removed = sweep(&map);
            if removed > 0 {
                debug!(removed, "kv memory: swept expired keys");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.set("a", "1", SetOptions::default()));
        assert_eq!(store.get("a").as_deref(), Some("1"));
        store.delete("a");
        assert_eq!(store.get("a"), None);
        // Deleting a missing key is a no-op.
        store.delete("a");
    }

    #[tokio::test]
    async fn plain_set_overwrites() {
        let store = MemoryStore::new();
        store.set("a", "1", SetOptions::default());
        assert!(store.set("a", "2", SetOptions::default()));
        assert_eq!(store.get("a").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn nx_refuses_live_key() {
        let store = MemoryStore::new();
        assert!(store.set("lock:x", "t1", SetOptions::nx(Duration::from_secs(5))));
        assert!(!store.set("lock:x", "t2", SetOptions::nx(Duration::from_secs(5))));
        assert_eq!(store.get("lock:x").as_deref(), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn nx_succeeds_once_previous_holder_expired() {
        let store = MemoryStore::new();
        assert!(store.set("lock:x", "t1", SetOptions::nx(Duration::from_secs(5))));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.set("lock:x", "t2", SetOptions::nx(Duration::from_secs(5))));
        assert_eq!(store.get("lock:x").as_deref(), Some("t2"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_lazily_on_read() {
        let store = MemoryStore::new();
        store.set("k", "v", SetOptions::ttl(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(store.get("k").as_deref(), Some("v"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("k"), None);
        assert_eq!(store.stored_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let store = MemoryStore::new();
        store.set("short", "v", SetOptions::ttl(Duration::from_secs(1)));
        store.set("long", "v", SetOptions::ttl(Duration::from_secs(100)));
        store.set("forever", "v", SetOptions::default());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.stored_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_without_reads() {
        let store = MemoryStore::new();
        store.set("k", "v", SetOptions::ttl(Duration::from_secs(1)));
        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(store.stored_len(), 0);
    }

    #[test]
    fn works_outside_a_runtime() {
        let store = MemoryStore::new();
        assert!(store.set("k", "v", SetOptions::default()));
        assert_eq!(store.get("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "v", SetOptions::default());
        assert_eq!(b.get("k").as_deref(), Some("v"));
    }
}
