//! # KV — Pluggable Key-Value Store
//!
//! One get/set/delete contract over three backends. The conditional set
//! (`SET key value NX EX n`) is atomic on every backend, and the lock
//! manager and cache-aside layer depend on exactly that.
//!
//! | Variant | Selected by | Prefix delete | Cross-process safe |
//! |---------|-------------|---------------|--------------------|
//! | [`KvStore::Rest`] | `http://` / `https://` URL | yes (SCAN + DEL) | yes |
//! | [`KvStore::Tcp`] | `redis://` / `rediss://` URL | yes (SCAN + DEL) | yes |
//! | [`KvStore::Memory`] | no URL configured | no (TTL only) | **no** |
//!
//! ## Return-value contract
//!
//! - `set` → `true` when the server answered `"OK"`, `false` on `null`
//!   (an `NX` set against a live key)
//! - `get` → `Some(value)` or `None` when absent or expired
//! - `delete` → `()`; deleting a missing key is not an error
//!
//! ## Process-local fallback
//!
//! With no URL the store lives in this process only. Locks still work between
//! tasks of one process but provide no exclusion between processes, and a
//! warning is logged at start-up. [`KvStore::is_process_local`] lets callers
//! check for this instead of relying on it silently.

mod memory;
mod rest;
mod tcp;

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use tcp::TcpStore;

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Options for [`KvStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expire the key after this long. `None` keeps it until deleted.
    pub ttl: Option<Duration>,
    /// Only write when the key is absent (`NX`).
    pub only_if_absent: bool,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        SetOptions {
            ttl: Some(ttl),
            only_if_absent: false,
        }
    }

    /// Conditional set with expiry, the lock acquisition primitive.
    pub fn nx(ttl: Duration) -> Self {
        SetOptions {
            ttl: Some(ttl),
            only_if_absent: true,
        }
    }
}

/// Which backend a [`KvStore`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KvBackendKind {
    Rest,
    Tcp,
    Memory,
}

impl fmt::Display for KvBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvBackendKind::Rest => write!(f, "rest"),
            KvBackendKind::Tcp => write!(f, "tcp"),
            KvBackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// Result of [`KvStore::delete_prefix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixDelete {
    /// Number of keys removed.
    Deleted(u64),
    /// The backend cannot enumerate keys; entries age out via TTL instead.
    Unsupported,
}

#[derive(Clone)]
pub enum KvStore {
    Rest(RestStore),
    Tcp(TcpStore),
    Memory(MemoryStore),
}

impl KvStore {
    /// Pick a backend from the connection string scheme.
    ///
    /// `None` or an empty string selects the process-local store and logs a
    /// warning. An unknown scheme is a configuration error rather than a
    /// silent fallback.
    pub async fn connect(url: Option<&str>, rest_token: Option<&str>) -> Result<Self> {
        let url = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => u,
            None => {
                warn!(
                    "KV_URL not set; using process-local key-value store. \
                     Task locks will NOT exclude other processes"
                );
                return Ok(KvStore::memory());
            }
        };

        let parsed = url::Url::parse(url)?;
        let store = match parsed.scheme() {
            "http" | "https" => KvStore::Rest(RestStore::new(&parsed, rest_token)?),
            "redis" | "rediss" => KvStore::Tcp(TcpStore::connect(url).await?),
            other => bail!(
                "unsupported KV_URL scheme '{}' (expected https, redis, or rediss)",
                other
            ),
        };
        info!(backend = %store.kind(), host = parsed.host_str().unwrap_or(""), "kv store connected");
        Ok(store)
    }

    /// A fresh process-local store.
    pub fn memory() -> Self {
        KvStore::Memory(MemoryStore::new())
    }

    pub fn kind(&self) -> KvBackendKind {
        match self {
            KvStore::Rest(_) => KvBackendKind::Rest,
            KvStore::Tcp(_) => KvBackendKind::Tcp,
            KvStore::Memory(_) => KvBackendKind::Memory,
        }
    }

    /// True when locks taken through this store only exclude tasks inside
    /// the current process.
    pub fn is_process_local(&self) -> bool {
        matches!(self, KvStore::Memory(_))
    }

    pub fn supports_prefix_delete(&self) -> bool {
        !self.is_process_local()
    }

    /// `SET key value [NX] [EX seconds]`. Returns whether the write happened.
    pub async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        match self {
            KvStore::Rest(s) => s.set(key, value, opts).await,
            KvStore::Tcp(s) => s.set(key, value, opts).await,
            KvStore::Memory(s) => Ok(s.set(key, value, opts)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            KvStore::Rest(s) => s.get(key).await,
            KvStore::Tcp(s) => s.get(key).await,
            KvStore::Memory(s) => Ok(s.get(key)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            KvStore::Rest(s) => s.delete(key).await,
            KvStore::Tcp(s) => s.delete(key).await,
            KvStore::Memory(s) => {
                s.delete(key);
                Ok(())
            }
        }
    }

    /// Delete every key starting with `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<PrefixDelete> {
        match self {
            KvStore::Rest(s) => s.delete_prefix(prefix).await.map(PrefixDelete::Deleted),
            KvStore::Tcp(s) => s.delete_prefix(prefix).await.map(PrefixDelete::Deleted),
            KvStore::Memory(_) => Ok(PrefixDelete::Unsupported),
        }
    }
}

/// Whole seconds for `EX`, rounded up and never zero (servers reject `EX 0`).
pub(crate) fn expire_secs(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

/// Glob pattern matching keys that start with `prefix`, with glob
/// metacharacters in the prefix escaped.
pub(crate) fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}
