//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use cachet_core::error::{CacheError, Result};
use cachet_core::{CacheEngine, EngineConfig, KeyKind, KvBackend, MemoryStore, ScanPage, TtlState};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// [`MemoryStore`] wrapper that fails selected operations on demand
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    /// get, key_kind, hash reads
    pub fail_reads: AtomicBool,
    /// set, mset, hash writes, expire
    pub fail_writes: AtomicBool,
    /// hash_set_all only
    pub fail_hash_writes: AtomicBool,
    /// mset only; single-key writes still go through
    pub fail_bulk_writes: AtomicBool,
    pub fail_locks: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Scan pages served before every further scan call fails
    pub scan_pages_before_failure: AtomicUsize,
    pub fail_scan: AtomicBool,
    scans: AtomicUsize,
    /// Keys reported as a structure the cache never writes (list, set...)
    foreign: Mutex<HashMap<String, String>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Make `key_kind` report `key` as a `kind` structure
    pub fn add_foreign(&self, key: &str, kind: &str) {
        self.foreign.lock().insert(key.to_string(), kind.to_string());
    }

    pub fn heal(&self) {
        for flag in [
            &self.fail_reads,
            &self.fail_writes,
            &self.fail_hash_writes,
            &self.fail_bulk_writes,
            &self.fail_locks,
            &self.fail_deletes,
            &self.fail_scan,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(CacheError::StoreUnavailable(format!("injected {} failure", op)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvBackend for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Self::check(&self.fail_reads, "get")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        Self::check(&self.fail_writes, "set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        Self::check(&self.fail_locks, "set_nx")?;
        self.inner.set_nx(key, value, ttl).await
    }

    async fn mset(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        Self::check(&self.fail_writes, "mset")?;
        Self::check(&self.fail_bulk_writes, "mset")?;
        self.inner.mset(entries, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Self::check(&self.fail_deletes, "delete")?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        Self::check(&self.fail_deletes, "delete_many")?;
        self.inner.delete_many(keys).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Self::check(&self.fail_writes, "expire")?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<TtlState> {
        Self::check(&self.fail_reads, "ttl")?;
        self.inner.ttl(key).await
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        Self::check(&self.fail_reads, "type")?;
        let foreign = self.foreign.lock().get(key).cloned();
        if let Some(kind) = foreign {
            return Ok(KeyKind::Other(kind));
        }
        self.inner.key_kind(key).await
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        Self::check(&self.fail_writes, "hset")?;
        Self::check(&self.fail_hash_writes, "hset")?;
        self.inner.hash_set_all(key, fields).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Self::check(&self.fail_reads, "hgetall")?;
        self.inner.hash_get_all(key).await
    }

    async fn hash_multi_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        Self::check(&self.fail_reads, "hmget")?;
        self.inner.hash_multi_get(key, fields).await
    }

    async fn hash_len(&self, key: &str) -> Result<usize> {
        Self::check(&self.fail_reads, "hlen")?;
        self.inner.hash_len(key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        Self::check(&self.fail_locks, "compare_and_delete")?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        Self::check(&self.fail_scan, "scan")?;
        let served = self.scans.fetch_add(1, Ordering::SeqCst);
        let limit = self.scan_pages_before_failure.load(Ordering::SeqCst);
        if limit > 0 && served >= limit {
            return Err(CacheError::StoreUnavailable("injected scan failure".to_string()));
        }
        self.inner.scan(cursor, pattern, count).await
    }
}

/// Engine over a fresh [`FlakyStore`]
pub fn flaky_engine(config: EngineConfig) -> (CacheEngine, Arc<FlakyStore>) {
    init_tracing();
    let store = FlakyStore::new();
    let engine = CacheEngine::new(config, store.clone()).expect("valid config");
    (engine, store)
}

/// Engine over a fresh [`MemoryStore`]
pub fn memory_engine(config: EngineConfig) -> (CacheEngine, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = CacheEngine::new(config, store.clone()).expect("valid config");
    (engine, store)
}
