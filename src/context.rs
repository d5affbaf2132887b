//! Application context: every shared service, built once at start-up.
//!
//! There are no process globals. `main` builds one [`AppContext`] and hands
//! an `Arc` of it to the scheduler, the HTTP server, and CLI commands. Tests
//! build their own with [`AppContext::from_parts`]. Dropping the context is
//! the only way to reset the memoized storage choice.

use crate::cache::CacheAside;
use crate::config::Settings;
use crate::kv::KvStore;
use crate::lock::LockManager;
use crate::prom_metrics::Metrics;
use crate::provider::{self, ProviderClient};
use crate::runner::TaskRunner;
use crate::storage::{Storage, StorageSelector};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub settings: Settings,
    pub kv: KvStore,
    pub locks: LockManager,
    pub cache: CacheAside,
    pub storage: Arc<StorageSelector>,
    pub runner: TaskRunner,
    pub metrics: Arc<Metrics>,
    /// Absent when no provider URL is configured.
    pub provider: Option<ProviderClient>,
}

impl AppContext {
    /// Connect the KV store and build all services from `settings`.
    ///
    /// Storage is probed lazily on first use, not here.
    pub async fn init(settings: Settings) -> Result<Arc<Self>> {
        let conn = &settings.connections;
        let kv = KvStore::connect(conn.kv_url.as_deref(), conn.kv_rest_token.as_deref()).await?;
        let provider =
            provider::from_settings(conn.provider_url.as_deref(), conn.provider_api_key.as_deref())?;
        let storage = Arc::new(StorageSelector::new(settings.storage_config()));
        info!(
            kv = %kv.kind(),
            provider = provider.is_some(),
            "application context ready"
        );
        Ok(Arc::new(Self::assemble(settings, kv, storage, provider)))
    }

    /// Build a context around an already-chosen storage backend.
    pub fn from_parts(
        settings: Settings,
        kv: KvStore,
        storage: Storage,
        provider: Option<ProviderClient>,
    ) -> Arc<Self> {
        let storage = Arc::new(StorageSelector::with_storage(storage));
        Arc::new(Self::assemble(settings, kv, storage, provider))
    }

    fn assemble(
        settings: Settings,
        kv: KvStore,
        storage: Arc<StorageSelector>,
        provider: Option<ProviderClient>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let locks = LockManager::new(kv.clone());
        let cache = CacheAside::new(kv.clone(), metrics.clone());
        let runner = TaskRunner::new(
            locks.clone(),
            storage.clone(),
            metrics.clone(),
            settings.runner_config(),
        );
        AppContext {
            settings,
            kv,
            locks,
            cache,
            storage,
            runner,
            metrics,
            provider,
        }
    }

    /// The selected storage backend, probing on first call.
    pub async fn store(&self) -> &Storage {
        self.storage.get().await
    }
}
