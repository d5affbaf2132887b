//! # Cache — Cache-Aside Reads over the Key-Value Store
//!
//! Reads check the store first and fall back to the source of truth on a
//! miss, populating the cache on the way out. Writes to an entity invalidate
//! its whole key namespace before the write is reported as done.
//!
//! ## Soft failure
//!
//! The cache never blocks access to the source of truth. A failed read is a
//! miss, an undecodable entry is a miss, and a failed write is ignored. All
//! three are logged.
//!
//! ## Keys
//!
//! `<domain>:<entityId>:<rangeStart|all>:<rangeEnd|all>`, built by
//! [`cache_key`]. Invalidation deletes the prefix `<domain>:<entityId>:`.
//! Entity ids must not contain `:` or one entity's prefix could cover
//! another's keys; channel ids are UUIDs.
//!
//! ## Process-local store
//!
//! The in-memory store cannot enumerate keys, so invalidation there returns
//! [`Invalidation::TtlOnly`]: cached values stay visible until their TTL
//! runs out.
//!
//! ## Write-back race
//!
//! Invalidation is not fenced against readers already in flight. A reader
//! that computed its value before a write and stores it after the writer's
//! invalidation leaves a stale entry, visible until its TTL runs out. The TTL
//! is the bound on staleness in that window as well.

use crate::kv::{KvStore, PrefixDelete, SetOptions};
use crate::prom_metrics::Metrics;
use anyhow::Result;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder for an open range bound in cache keys.
pub const OPEN_BOUND: &str = "all";

/// Build a cache key for an entity-scoped range query.
pub fn cache_key(
    domain: &str,
    entity_id: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> String {
    let bound = |d: Option<NaiveDate>| match d {
        Some(day) => day.format("%Y-%m-%d").to_string(),
        None => OPEN_BOUND.to_string(),
    };
    format!("{}:{}:{}:{}", domain, entity_id, bound(start), bound(end))
}

/// Key prefix covering every cached query for one entity.
pub fn entity_prefix(domain: &str, entity_id: &str) -> String {
    format!("{}:{}:", domain, entity_id)
}

/// Result of an invalidation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// The namespace was cleared; holds the number of keys removed.
    Deleted(u64),
    /// The store cannot delete by prefix; entries expire with their TTL.
    TtlOnly,
    /// The store errored; entries expire with their TTL.
    Failed,
}

#[derive(Clone)]
pub struct CacheAside {
    kv: KvStore,
    metrics: Arc<Metrics>,
}

impl CacheAside {
    pub fn new(kv: KvStore, metrics: Arc<Metrics>) -> Self {
        CacheAside { kv, metrics }
    }

    /// Return the cached value under `key`, or compute, cache, and return it.
    ///
    /// Only `compute`'s own error is returned; cache errors are logged.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.kv.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    self.metrics.inc_cache("hit");
                    return Ok(value);
                }
                Err(e) => warn!(key, error = %e, "cache: undecodable entry, recomputing"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %format!("{e:#}"), "cache: read failed, using source of truth");
                self.metrics.inc_cache("error");
            }
        }
        self.metrics.inc_cache("miss");

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.kv.set(key, &raw, SetOptions::ttl(ttl)).await {
                    warn!(key, error = %format!("{e:#}"), "cache: write failed, value served uncached");
                }
            }
            Err(e) => warn!(key, error = %e, "cache: value not serializable, skipping write"),
        }
        Ok(value)
    }

    /// Delete every cached entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Invalidation {
        let outcome = match self.kv.delete_prefix(prefix).await {
            Ok(PrefixDelete::Deleted(n)) => {
                debug!(prefix, deleted = n, "cache invalidated");
                Invalidation::Deleted(n)
            }
            Ok(PrefixDelete::Unsupported) => {
                debug!(prefix, "cache: store has no prefix delete, relying on TTL");
                Invalidation::TtlOnly
            }
            Err(e) => {
                warn!(prefix, error = %format!("{e:#}"), "cache: invalidation failed, relying on TTL");
                Invalidation::Failed
            }
        };
        self.metrics.inc_invalidation(match outcome {
            Invalidation::Deleted(_) => "deleted",
            Invalidation::TtlOnly => "ttl_only",
            Invalidation::Failed => "failed",
        });
        outcome
    }

    /// Invalidate all cached queries for one entity in `domain`.
    pub async fn invalidate_entity(&self, domain: &str, entity_id: &str) -> Invalidation {
        self.invalidate_prefix(&entity_prefix(domain, entity_id)).await
    }
}
