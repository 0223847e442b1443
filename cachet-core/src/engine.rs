use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{
    AccessStats, CacheRouter, CachedValue, EncodingKind, EntryInfo, EvictionReport,
    HotsetScheduler, Loader, PatternEvictor, PerformanceLedger, PerformanceReport,
    RefreshTaskInfo, StampedeGuard, StorageClassifier, StructuralCodec, TypeRegistry,
};
use crate::config::{BackendKind, EngineConfig};
use crate::error::Result;
use crate::store::{KvBackend, MemoryStore, SynapConfig, SynapStore};

/// One cache instance over one backend
///
/// Owns the shared state (ledger, hot-key scheduler, type registry) and the
/// three entry points built on it: the [`CacheRouter`] for direct
/// operations, the [`StampedeGuard`] for cache-aside reads and the
/// [`PatternEvictor`] for invalidation.
pub struct CacheEngine {
    config: EngineConfig,
    router: CacheRouter,
    guard: StampedeGuard,
    evictor: PatternEvictor,
    ledger: Arc<PerformanceLedger>,
    hotset: Arc<HotsetScheduler>,
    registry: Arc<TypeRegistry>,
}

impl CacheEngine {
    pub fn new(config: EngineConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(PerformanceLedger::new());
        let hotset = Arc::new(HotsetScheduler::new(config.hotset.clone()));
        let registry = Arc::new(TypeRegistry::new());

        let router = CacheRouter::new(
            backend.clone(),
            StorageClassifier::new(config.classifier.clone()),
            StructuralCodec::new(registry.clone()),
            ledger.clone(),
        );
        let guard = StampedeGuard::new(router.clone(), hotset.clone(), config.guard.clone());
        let evictor = PatternEvictor::new(
            backend,
            hotset.clone(),
            ledger.clone(),
            config.evictor.scan_batch,
        );

        Ok(Self {
            config,
            router,
            guard,
            evictor,
            ledger,
            hotset,
            registry,
        })
    }

    /// Build the backend named by `config.backend` and wire the engine on it
    pub fn connect(config: EngineConfig) -> Result<Self> {
        let backend: Arc<dyn KvBackend> = match config.backend.kind {
            BackendKind::Memory => {
                info!("Using in-process memory store");
                Arc::new(MemoryStore::new())
            }
            BackendKind::Synap => {
                info!("Using Synap store at {}", config.backend.url);
                Arc::new(SynapStore::new(SynapConfig::from(&config.backend))?)
            }
        };
        Self::new(config, backend)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router(&self) -> &CacheRouter {
        &self.router
    }

    pub fn guard(&self) -> &StampedeGuard {
        &self.guard
    }

    pub fn evictor(&self) -> &PatternEvictor {
        &self.evictor
    }

    /// Types structured entries can be rebuilt into by [`get_value`](Self::get_value)
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        self.router.backend()
    }

    // Direct operations

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<EncodingKind> {
        self.router.set(key, value, ttl).await
    }

    pub async fn set_with_encoding<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        kind: EncodingKind,
    ) -> Result<EncodingKind> {
        self.router.set_with_encoding(key, value, ttl, kind).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.router.get(key).await
    }

    pub async fn get_value(&self, key: &str) -> Option<CachedValue> {
        self.router.get_value(key).await
    }

    pub async fn get_fields(&self, key: &str, fields: &[&str]) -> HashMap<String, Value> {
        self.router.get_fields(key, fields).await
    }

    pub async fn set_fields(
        &self,
        key: &str,
        fields: &[(&str, Value)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.router.set_fields(key, fields, ttl).await
    }

    pub async fn multi_set<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.router.multi_set(entries, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.router.delete(key).await
    }

    pub async fn inspect(&self, key: &str) -> EntryInfo {
        self.router.inspect(key).await
    }

    // Guarded reads and invalidation

    /// Cache-aside read through the [`StampedeGuard`]
    pub async fn read<T, L>(
        &self,
        key: &str,
        loader: L,
        ttl: Option<Duration>,
        cache_absent: bool,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        L: Loader<T> + 'static,
    {
        self.guard.read(key, loader, ttl, cache_absent).await
    }

    pub async fn evict(&self, pattern: &str) -> EvictionReport {
        self.evictor.evict(pattern).await
    }

    // Observability

    pub fn performance_report(&self) -> PerformanceReport {
        self.ledger.report()
    }

    /// The `n` most accessed keys
    pub fn hot_keys(&self, n: usize) -> Vec<AccessStats> {
        self.hotset.top_n(n)
    }

    pub fn access_snapshot(&self) -> Vec<AccessStats> {
        self.hotset.snapshot()
    }

    pub fn refresh_tasks(&self) -> Vec<RefreshTaskInfo> {
        self.hotset.refresh_tasks()
    }

    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    pub fn hotset(&self) -> &Arc<HotsetScheduler> {
        &self.hotset
    }

    // Lifecycle

    /// Start the periodic collection of idle access statistics
    pub fn start_janitor(&self) -> JoinHandle<()> {
        self.hotset.start_janitor()
    }

    /// Stop every background refresh task
    pub async fn shutdown(&self) {
        info!("Shutting down cache engine");
        self.hotset.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryEncoding;
    use crate::config::BackendConfig;
    use crate::error::CacheError;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        sku: String,
        price: f64,
        stock: u32,
    }

    fn engine() -> CacheEngine {
        CacheEngine::connect(EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_memory_roundtrip() {
        let engine = engine();
        let product = Product {
            sku: "A-1".to_string(),
            price: 9.5,
            stock: 3,
        };

        let kind = engine
            .set("product:1", &product, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(kind, EncodingKind::Structured);
        assert_eq!(engine.get::<Product>("product:1").await, Some(product));

        let info = engine.inspect("product:1").await;
        assert_eq!(info.encoding, EntryEncoding::Structured);

        let report = engine.performance_report();
        assert_eq!(report.keys.len(), 1);
        assert_eq!(report.keys[0].key, "product:1");
    }

    #[tokio::test]
    async fn test_registry_drives_get_value() {
        let engine = engine();
        engine.registry().register::<Product>();
        let product = Product {
            sku: "B-2".to_string(),
            price: 1.0,
            stock: 0,
        };
        engine.set("product:2", &product, None).await.unwrap();

        match engine.get_value("product:2").await {
            Some(CachedValue::Typed(typed)) => {
                assert_eq!(typed.downcast_ref::<Product>(), Some(&product));
            }
            other => panic!("expected typed value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.classifier.min_fields = 10;
        config.classifier.max_fields = 2;
        let result = CacheEngine::new(config, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_synap_rejects_bad_url() {
        let config = EngineConfig {
            backend: BackendConfig {
                kind: BackendKind::Synap,
                url: "not a url".to_string(),
                ..BackendConfig::default()
            },
            ..EngineConfig::default()
        };
        assert!(matches!(
            CacheEngine::connect(config),
            Err(CacheError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_read_evict_and_shutdown() {
        let engine = engine();
        let value: Option<u64> = engine
            .read("counter:1", || async { Ok(Some(5u64)) }, None, false)
            .await
            .unwrap();
        assert_eq!(value, Some(5));
        assert_eq!(engine.access_snapshot().len(), 1);

        let report = engine.evict("counter:*").await;
        assert_eq!(report.deleted, 1);
        assert!(engine.access_snapshot().is_empty());
        assert!(engine.hot_keys(5).is_empty());

        engine.shutdown().await;
        assert!(engine.refresh_tasks().is_empty());
    }
}
