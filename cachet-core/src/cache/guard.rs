//! Cache-aside reads with stampede and penetration protection
//!
//! ```text
//! MISS -> LOCK_WAIT -> LOCKED_LOAD  -> DONE
//!                   \-> LOCK_TIMEOUT -> DONE
//! ```
//!
//! On a miss only the caller holding the per-key lock runs the loader and
//! fills the cache. Everyone else waits once, re-reads, and falls back to the
//! loader without caching. Absent values can be cached as a sentinel so a
//! missing row does not hit the source on every read.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::hotset::{HotsetScheduler, RefreshJob};
use super::router::{CacheRouter, RawEntry};
use crate::config::GuardConfig;
use crate::error::{CacheError, Result};
use crate::store::KvBackend;

/// Source of truth for a cached value
#[async_trait]
pub trait Loader<T>: Send + Sync {
    /// `Ok(None)` when the value does not exist
    async fn load(&self) -> anyhow::Result<Option<T>>;
}

#[async_trait]
impl<T, F, Fut> Loader<T> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    T: Send + 'static,
{
    async fn load(&self) -> anyhow::Result<Option<T>> {
        (self)().await
    }
}

/// Ownership of a per-key lock
///
/// Released by compare-and-delete with the token it was acquired with. A lease
/// dropped without [`release`](LockLease::release) schedules the release on
/// the current runtime.
pub struct LockLease {
    backend: Arc<dyn KvBackend>,
    key: String,
    token: String,
    released: bool,
}

impl LockLease {
    /// Try to take the lock at `key` for `lease`
    pub async fn acquire(
        backend: Arc<dyn KvBackend>,
        key: String,
        lease: Duration,
    ) -> Result<Option<LockLease>> {
        let token = uuid::Uuid::new_v4().to_string();
        if !backend.set_nx(&key, &token, lease).await? {
            return Ok(None);
        }
        debug!("Acquired lock {} (lease {:?})", key, lease);
        Ok(Some(LockLease {
            backend,
            key,
            token,
            released: false,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Delete the lock if we still own it
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.backend.compare_and_delete(&self.key, &self.token).await {
            Ok(true) => {
                debug!("Released lock {}", self.key);
                true
            }
            Ok(false) => {
                warn!("Lock {} expired before release", self.key);
                false
            }
            Err(e) => {
                warn!("Releasing lock {} failed: {}", self.key, e);
                false
            }
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Lock {} dropped outside a runtime, left to expire", self.key);
            return;
        };
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = backend.compare_and_delete(&key, &token).await {
                warn!("Releasing dropped lock {} failed: {}", key, e);
            }
        });
    }
}

/// Reloads a hot key through the loader that first promoted it
struct GuardedRefresh<T> {
    router: CacheRouter,
    loader: Arc<dyn Loader<T>>,
    ttl: Option<Duration>,
    _value: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> RefreshJob for GuardedRefresh<T>
where
    T: Serialize + Send + Sync + 'static,
{
    async fn refresh(&self, key: &str) -> Result<bool> {
        let value = self
            .loader
            .load()
            .await
            .map_err(|source| CacheError::Loader {
                key: key.to_string(),
                source,
            })?;
        match value {
            Some(value) => {
                self.router.set(key, &value, self.ttl).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// What the first read found
enum Probe<T> {
    Hit(T),
    Absent,
    Miss,
}

/// Stampede-protected read path
#[derive(Clone)]
pub struct StampedeGuard {
    router: CacheRouter,
    hotset: Arc<HotsetScheduler>,
    config: GuardConfig,
}

impl StampedeGuard {
    pub fn new(router: CacheRouter, hotset: Arc<HotsetScheduler>, config: GuardConfig) -> Self {
        Self {
            router,
            hotset,
            config,
        }
    }

    pub fn hotset(&self) -> &Arc<HotsetScheduler> {
        &self.hotset
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.config.lock_prefix, key)
    }

    /// Read `key`, loading it on a miss.
    ///
    /// Store failures never surface: they degrade to calling the loader
    /// directly. The only error is the loader's own.
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
        let loader: Arc<dyn Loader<T>> = Arc::new(loader);

        match self.probe::<T>(key).await {
            Ok(Probe::Hit(value)) => {
                self.on_hit(key, &loader, ttl);
                return Ok(Some(value));
            }
            Ok(Probe::Absent) => {
                debug!("Cached absence for {}", key);
                return Ok(None);
            }
            Ok(Probe::Miss) => self.hotset.record_miss(key),
            Err(e) => {
                warn!("Cache read for {} failed, loading from source: {}", key, e);
                return self.load_direct(key, &loader).await;
            }
        }

        let lease = match LockLease::acquire(
            self.router.backend().clone(),
            self.lock_key(key),
            self.config.lock_lease(),
        )
        .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Locking {} failed, loading from source: {}", key, e);
                return self.load_direct(key, &loader).await;
            }
        };

        match lease {
            Some(lease) => {
                let result = self
                    .load_locked(key, &loader, ttl, cache_absent)
                    .await;
                lease.release().await;
                result
            }
            None => self.wait_for_holder(key, &loader).await,
        }
    }

    async fn probe<T: DeserializeOwned>(&self, key: &str) -> Result<Probe<T>> {
        let entry = self.router.read_entry(key).await?;
        match &entry {
            RawEntry::Missing => return Ok(Probe::Miss),
            RawEntry::Flat(text) if *text == self.config.null_sentinel => {
                return Ok(Probe::Absent);
            }
            _ => {}
        }
        // An entry that no longer decodes is reloaded like a miss
        Ok(match self.router.decode::<T>(key, entry) {
            Some(value) => Probe::Hit(value),
            None => Probe::Miss,
        })
    }

    fn on_hit<T>(&self, key: &str, loader: &Arc<dyn Loader<T>>, ttl: Option<Duration>)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.hotset.record_hit(key);
        if self.hotset.should_promote(key) && !self.hotset.is_registered(key) {
            let job = GuardedRefresh {
                router: self.router.clone(),
                loader: loader.clone(),
                ttl,
                _value: PhantomData,
            };
            self.hotset.register(key, Arc::new(job), ttl);
        }
    }

    /// LOCKED_LOAD: we own the lock
    async fn load_locked<T>(
        &self,
        key: &str,
        loader: &Arc<dyn Loader<T>>,
        ttl: Option<Duration>,
        cache_absent: bool,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        // Someone may have filled the entry between our miss and the lock
        match self.probe::<T>(key).await {
            Ok(Probe::Hit(value)) => {
                debug!("{} filled while acquiring the lock", key);
                return Ok(Some(value));
            }
            Ok(Probe::Absent) => return Ok(None),
            Ok(Probe::Miss) => {}
            Err(e) => debug!("Re-check of {} failed: {}", key, e),
        }

        let loaded = loader.load().await.map_err(|source| CacheError::Loader {
            key: key.to_string(),
            source,
        })?;

        match loaded {
            Some(value) => {
                if let Err(e) = self.router.set(key, &value, ttl).await {
                    warn!("Caching loaded value for {} failed: {}", key, e);
                }
                Ok(Some(value))
            }
            None => {
                if cache_absent {
                    let backend = self.router.backend();
                    match backend
                        .set(key, &self.config.null_sentinel, Some(self.config.null_ttl()))
                        .await
                    {
                        Ok(()) => debug!(
                            "Cached absence for {} ({:?})",
                            key,
                            self.config.null_ttl()
                        ),
                        Err(e) => warn!("Caching absence for {} failed: {}", key, e),
                    }
                }
                Ok(None)
            }
        }
    }

    /// LOCK_TIMEOUT: someone else holds the lock
    async fn wait_for_holder<T>(&self, key: &str, loader: &Arc<dyn Loader<T>>) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        tokio::time::sleep(self.config.retry_delay()).await;

        // The miss for this read is already counted
        match self.probe::<T>(key).await {
            Ok(Probe::Hit(value)) => return Ok(Some(value)),
            Ok(_) => {}
            Err(e) => debug!("Re-read of {} failed: {}", key, e),
        }

        info!("Lock for {} still held, bypassing cache", key);
        self.load_direct(key, loader).await
    }

    async fn load_direct<T>(&self, key: &str, loader: &Arc<dyn Loader<T>>) -> Result<Option<T>> {
        loader.load().await.map_err(|source| CacheError::Loader {
            key: key.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::classifier::StorageClassifier;
    use crate::cache::codec::{StructuralCodec, TypeRegistry};
    use crate::cache::ledger::PerformanceLedger;
    use crate::config::HotsetConfig;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> (StampedeGuard, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let router = CacheRouter::new(
            store.clone(),
            StorageClassifier::default(),
            StructuralCodec::new(Arc::new(TypeRegistry::new())),
            Arc::new(PerformanceLedger::new()),
        );
        let hotset = Arc::new(HotsetScheduler::new(HotsetConfig::default()));
        (
            StampedeGuard::new(router, hotset, GuardConfig::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_miss_loads_and_caches() {
        let (guard, store) = guard();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value: Option<String> = guard
                .read(
                    "greeting",
                    move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(Some("hello".to_string()))
                        }
                    },
                    Some(Duration::from_secs(60)),
                    false,
                )
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("hello"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("lock:greeting").await.unwrap(), None);
        let stats = guard.hotset().stats("greeting").unwrap();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 2);
    }

    #[tokio::test]
    async fn test_loader_error_releases_lock() {
        let (guard, store) = guard();
        let result: Result<Option<u32>> = guard
            .read(
                "broken",
                || async { Err(anyhow::anyhow!("database down")) },
                None,
                true,
            )
            .await;

        assert!(matches!(result, Err(CacheError::Loader { .. })));
        assert_eq!(store.get("lock:broken").await.unwrap(), None);
        assert_eq!(store.get("broken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_bypasses_cache() {
        let (guard, store) = guard();
        store
            .set_nx("lock:busy", "someone-else", Duration::from_secs(10))
            .await
            .unwrap();

        let value: Option<u32> = guard
            .read("busy", || async { Ok(Some(7)) }, None, false)
            .await
            .unwrap();
        assert_eq!(value, Some(7));
        // bypass path does not cache
        assert_eq!(store.get("busy").await.unwrap(), None);
        assert_eq!(
            store.get("lock:busy").await.unwrap(),
            Some("someone-else".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let store: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let lease = LockLease::acquire(store.clone(), "lock:x".to_string(), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(
            LockLease::acquire(store.clone(), "lock:x".to_string(), Duration::from_secs(10))
                .await
                .unwrap()
                .is_none()
        );

        drop(lease);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("lock:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_after_expiry_keeps_new_holder() {
        let store: Arc<dyn KvBackend> = Arc::new(MemoryStore::new());
        let stale = LockLease::acquire(store.clone(), "lock:y".to_string(), Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = LockLease::acquire(store.clone(), "lock:y".to_string(), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!stale.release().await);
        assert_eq!(
            store.get("lock:y").await.unwrap().as_deref(),
            Some(fresh.token())
        );
        assert!(fresh.release().await);
    }
}
