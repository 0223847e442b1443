//! Hot-key tracking and background refresh
//!
//! Every guarded read updates the key's access counters. Once a key is read
//! often enough with a high enough hit rate it is promoted: a refresh task
//! reloads it on a fixed interval so it never expires under load.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HotsetConfig;
use crate::error::Result;

/// Refresh intervals never exceed this share of the entry TTL
const TTL_REFRESH_RATIO: f64 = 0.8;

/// Reloads one key into the cache
#[async_trait]
pub trait RefreshJob: Send + Sync {
    /// Returns whether a fresh value was written
    async fn refresh(&self, key: &str) -> Result<bool>;
}

#[derive(Debug)]
struct AccessCounters {
    accesses: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Unix millis of the last access
    last_access: AtomicI64,
}

impl AccessCounters {
    fn new() -> Self {
        Self {
            accesses: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_access: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn touch(&self, hit: bool) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.last_access
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self, key: &str) -> AccessStats {
        let access_count = self.accesses.load(Ordering::Relaxed);
        let hit_count = self.hits.load(Ordering::Relaxed);
        let last_access_ms = self.last_access.load(Ordering::Relaxed);
        AccessStats {
            key: key.to_string(),
            access_count,
            hit_count,
            miss_count: self.misses.load(Ordering::Relaxed),
            hit_rate: if access_count == 0 {
                0.0
            } else {
                hit_count as f64 / access_count as f64
            },
            last_access: Utc
                .timestamp_millis_opt(last_access_ms)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Access statistics for one key
#[derive(Debug, Clone, Serialize)]
pub struct AccessStats {
    pub key: String,
    pub access_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub last_access: DateTime<Utc>,
}

/// A registered refresh task, as reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct RefreshTaskInfo {
    pub key: String,
    pub interval_ms: u64,
    pub ttl_secs: Option<u64>,
    pub runs: u64,
}

struct RefreshTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    interval: Duration,
    ttl: Option<Duration>,
    runs: Arc<AtomicU64>,
}

/// Tracks key popularity and owns the refresh tasks of hot keys
pub struct HotsetScheduler {
    config: HotsetConfig,
    stats: RwLock<HashMap<String, Arc<AccessCounters>>>,
    tasks: Mutex<HashMap<String, RefreshTask>>,
    workers: Arc<Semaphore>,
}

impl HotsetScheduler {
    pub fn new(config: HotsetConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.refresh_workers.max(1)));
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            workers,
        }
    }

    pub fn config(&self) -> &HotsetConfig {
        &self.config
    }

    pub fn record_hit(&self, key: &str) {
        self.counters(key).touch(true);
    }

    pub fn record_miss(&self, key: &str) {
        self.counters(key).touch(false);
    }

    fn counters(&self, key: &str) -> Arc<AccessCounters> {
        if let Some(counters) = self.stats.read().get(key) {
            return counters.clone();
        }
        self.stats
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AccessCounters::new()))
            .clone()
    }

    /// Hot keys: more than `min_accesses` reads with a hit rate above `min_hit_rate`
    pub fn should_promote(&self, key: &str) -> bool {
        let Some(counters) = self.stats.read().get(key).cloned() else {
            return false;
        };
        let stats = counters.snapshot(key);
        stats.access_count > self.config.min_accesses && stats.hit_rate > self.config.min_hit_rate
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.tasks.lock().contains_key(key)
    }

    /// Start a refresh task for `key` unless one is already running.
    ///
    /// Must be called from within a tokio runtime. Returns whether a task was
    /// started.
    pub fn register(&self, key: &str, job: Arc<dyn RefreshJob>, ttl: Option<Duration>) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(key) {
            return false;
        }

        let interval = self.interval_for(ttl);
        let (cancel, cancelled) = watch::channel(false);
        let runs = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(refresh_loop(
            key.to_string(),
            job,
            interval,
            cancelled,
            self.workers.clone(),
            runs.clone(),
        ));

        info!(
            "Promoted hot key {} (refresh every {:?}, ttl {:?})",
            key, interval, ttl
        );
        tasks.insert(
            key.to_string(),
            RefreshTask {
                cancel,
                handle,
                interval,
                ttl,
                runs,
            },
        );
        true
    }

    fn interval_for(&self, ttl: Option<Duration>) -> Duration {
        let configured = self.config.refresh_interval();
        match ttl {
            Some(ttl) if !ttl.is_zero() => {
                let cap = ttl.mul_f64(TTL_REFRESH_RATIO).max(Duration::from_millis(1));
                configured.min(cap)
            }
            _ => configured,
        }
    }

    /// Cancel the refresh task of `key`, wait for it to stop, then drop its
    /// access statistics. Returns whether a task was running.
    pub async fn unregister(&self, key: &str) -> bool {
        let task = self.tasks.lock().remove(key);
        let had_task = match task {
            Some(task) => {
                stop_task(key, task).await;
                true
            }
            None => false,
        };
        self.stats.write().remove(key);
        had_task
    }

    /// [`unregister`](Self::unregister) for many keys. Returns how many tasks were stopped.
    pub async fn unregister_many(&self, keys: &[String]) -> usize {
        let stopped: Vec<(String, RefreshTask)> = {
            let mut tasks = self.tasks.lock();
            keys.iter()
                .filter_map(|key| tasks.remove(key).map(|task| (key.clone(), task)))
                .collect()
        };

        let count = stopped.len();
        for (key, task) in stopped {
            stop_task(&key, task).await;
        }

        let mut stats = self.stats.write();
        for key in keys {
            stats.remove(key);
        }
        count
    }

    /// Remove statistics idle for longer than the configured horizon
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_idle(self.config.stats_horizon()).await
    }

    /// Remove statistics idle for longer than `horizon`. Keys whose statistics
    /// are collected also lose their refresh task.
    pub async fn cleanup_idle(&self, horizon: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - horizon.as_millis() as i64;
        let idle: Vec<String> = self
            .stats
            .read()
            .iter()
            .filter(|(_, counters)| counters.last_access.load(Ordering::Relaxed) < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        if idle.is_empty() {
            return 0;
        }
        self.unregister_many(&idle).await;
        debug!("Collected access statistics for {} idle keys", idle.len());
        idle.len()
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `cleanup_interval`.
    /// The task ends once the scheduler is dropped.
    pub fn start_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let period = self.config.cleanup_interval();
        info!("Starting hotset janitor (interval={:?})", period);

        let scheduler: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                let removed = scheduler.cleanup_expired().await;
                if removed > 0 {
                    info!("Hotset janitor removed {} idle keys", removed);
                }
            }
        })
    }

    /// The `n` most accessed keys, most accessed first
    pub fn top_n(&self, n: usize) -> Vec<AccessStats> {
        let mut all = self.snapshot();
        all.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.key.cmp(&b.key))
        });
        all.truncate(n);
        all
    }

    /// Statistics for every tracked key
    pub fn snapshot(&self) -> Vec<AccessStats> {
        self.stats
            .read()
            .iter()
            .map(|(key, counters)| counters.snapshot(key))
            .collect()
    }

    pub fn stats(&self, key: &str) -> Option<AccessStats> {
        self.stats.read().get(key).map(|counters| counters.snapshot(key))
    }

    pub fn refresh_tasks(&self) -> Vec<RefreshTaskInfo> {
        let mut infos: Vec<RefreshTaskInfo> = self
            .tasks
            .lock()
            .iter()
            .map(|(key, task)| RefreshTaskInfo {
                key: key.clone(),
                interval_ms: task.interval.as_millis() as u64,
                ttl_secs: task.ttl.map(|ttl| ttl.as_secs()),
                runs: task.runs.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Cancel and await every refresh task
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, RefreshTask)> = self.tasks.lock().drain().collect();
        if !tasks.is_empty() {
            info!("Stopping {} refresh tasks", tasks.len());
        }
        for (key, task) in tasks {
            stop_task(&key, task).await;
        }
    }
}

impl Drop for HotsetScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.handle.abort();
        }
    }
}

async fn stop_task(key: &str, task: RefreshTask) {
    let _ = task.cancel.send(true);
    match task.handle.await {
        Err(e) if !e.is_cancelled() => {
            warn!("Refresh task for {} ended abnormally: {}", key, e)
        }
        _ => {}
    }
    debug!("Refresh task for {} stopped", key);
}

async fn refresh_loop(
    key: String,
    job: Arc<dyn RefreshJob>,
    interval: Duration,
    mut cancelled: watch::Receiver<bool>,
    workers: Arc<Semaphore>,
    runs: Arc<AtomicU64>,
) {
    // Spread the first tick so keys promoted together do not refresh together
    let jitter = interval.mul_f64(rand::random::<f64>() * 0.1);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval + jitter, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancelled.changed() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            _ = cancelled.changed() => break,
            permit = workers.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            break;
        };

        match job.refresh(&key).await {
            Ok(true) => {
                runs.fetch_add(1, Ordering::Relaxed);
                debug!("Refreshed hot key {}", key);
            }
            Ok(false) => debug!("Refresh of {} produced no value", key),
            Err(e) => warn!("Refresh of {} failed: {}", key, e),
        }
    }
}
