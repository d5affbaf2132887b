//! # channelpulse — Task Orchestration for the Channel Metrics Dashboard
//!
//! Periodically pulls external metrics for tracked channels, stores derived
//! statistics, and serves them. This crate holds the coordination layer:
//!
//! - [`kv`]: pluggable key-value store (REST, Redis TCP, process-local)
//! - [`lock`]: advisory TTL lock on the store's conditional set
//! - [`cache`]: cache-aside reads with prefix invalidation
//! - [`runner`]: sequential batch runner with per-entity isolation
//! - [`storage`]: capability-probing persistence backend selection
//!
//! Supporting modules: [`context`] wires everything once at start-up,
//! [`tasks`] defines the concrete batch jobs, [`scheduler`] triggers them,
//! [`stats`] and [`daybucket`] serve the per-day read path, [`server`] exposes
//! health and metrics endpoints.

pub mod cache;
pub mod config;
pub mod context;
pub mod daybucket;
pub mod kv;
pub mod lock;
pub mod prom_metrics;
pub mod provider;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod storage;
pub mod tasks;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Every guarded structure here stays consistent across a panic (single
/// inserts and removals), so the poison flag carries no information.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Truncate `s` to at most `max_chars` characters, marking the cut with `...`.
///
/// Counts chars rather than bytes so multi-byte text from upstream error
/// messages never splits a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return s.chars().take(max_chars).collect();
    }
    let mut out: String = s.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

/// Text of a caught panic payload (`panic!` with a literal or a format).
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
