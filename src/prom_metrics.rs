//! # Prometheus Metrics — Task and Cache Counters
//!
//! Exposes channelpulse operational metrics in the Prometheus text exposition
//! format, rendered by the `/metrics` endpoint on each scrape.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `channelpulse_task_runs_total` | Counter | `task`, `status` | Batch runs by final status |
//! | `channelpulse_task_entities_total` | Counter | `task`, `outcome` | Entities processed, `ok` / `failed` |
//! | `channelpulse_task_last_duration_seconds` | Gauge | `task` | Duration of the latest run |
//! | `channelpulse_cache_requests_total` | Counter | `result` | Cache lookups: `hit` / `miss` / `error` |
//! | `channelpulse_cache_invalidations_total` | Counter | `result` | `deleted` / `ttl_only` / `failed` |

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskStatusLabel {
    pub task: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskOutcomeLabel {
    pub task: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabel {
    pub task: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabel {
    pub result: String,
}

/// Metric handles shared by the runner, the cache, and the HTTP endpoint.
///
/// All handles are atomic and safe to update from any task.
pub struct Metrics {
    pub registry: Registry,
    pub task_runs: Family<TaskStatusLabel, Counter>,
    pub task_entities: Family<TaskOutcomeLabel, Counter>,
    pub task_last_duration: Family<TaskLabel, Gauge<f64, AtomicU64>>,
    pub cache_requests: Family<ResultLabel, Counter>,
    pub cache_invalidations: Family<ResultLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let task_runs = Family::<TaskStatusLabel, Counter>::default();
        registry.register(
            "channelpulse_task_runs",
            "Batch task runs by final status",
            task_runs.clone(),
        );

        let task_entities = Family::<TaskOutcomeLabel, Counter>::default();
        registry.register(
            "channelpulse_task_entities",
            "Entities processed by batch tasks",
            task_entities.clone(),
        );

        let task_last_duration = Family::<TaskLabel, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "channelpulse_task_last_duration_seconds",
            "Wall time of the most recent run of each task",
            task_last_duration.clone(),
        );

        let cache_requests = Family::<ResultLabel, Counter>::default();
        registry.register(
            "channelpulse_cache_requests",
            "Cache-aside lookups by result",
            cache_requests.clone(),
        );

        let cache_invalidations = Family::<ResultLabel, Counter>::default();
        registry.register(
            "channelpulse_cache_invalidations",
            "Cache prefix invalidations by result",
            cache_invalidations.clone(),
        );

        Self {
            registry,
            task_runs,
            task_entities,
            task_last_duration,
            cache_requests,
            cache_invalidations,
        }
    }

    pub fn cache_result(&self, result: &str) -> u64 {
        self.cache_requests
            .get_or_create(&ResultLabel {
                result: result.to_string(),
            })
            .get()
    }

    pub(crate) fn inc_cache(&self, result: &str) {
        self.cache_requests
            .get_or_create(&ResultLabel {
                result: result.to_string(),
            })
            .inc();
    }

    pub(crate) fn inc_invalidation(&self, result: &str) {
        self.cache_invalidations
            .get_or_create(&ResultLabel {
                result: result.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
