//! Per-key performance statistics for each encoding
//!
//! Counters are monotonically increasing atomics; a bucket is created the
//! first time a (key, encoding) pair is observed and lives until the key is
//! forgotten. Nothing is persisted.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::classifier::EncodingKind;

/// Raw counters for one (key, encoding) pair
#[derive(Debug, Default)]
struct EncodingCounters {
    observations: AtomicU64,
    successes: AtomicU64,
    /// Cumulative latency in microseconds
    latency_us: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl EncodingCounters {
    fn record(&self, latency_ms: f64, success: bool, is_write: bool) {
        let micros = (latency_ms.max(0.0) * 1000.0).round() as u64;
        self.observations.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_us.fetch_add(micros, Ordering::Relaxed);
        if is_write {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> EncodingStats {
        let observations = self.observations.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let latency_us = self.latency_us.load(Ordering::Relaxed);

        let (avg_latency_ms, success_rate) = if observations == 0 {
            (0.0, 0.0)
        } else {
            (
                latency_us as f64 / 1000.0 / observations as f64,
                successes as f64 / observations as f64,
            )
        };

        EncodingStats {
            observations,
            successes,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            avg_latency_ms,
            success_rate,
            score: success_rate * 1000.0 / (1.0 + avg_latency_ms),
        }
    }
}

/// Point-in-time statistics for one encoding of one key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EncodingStats {
    pub observations: u64,
    pub successes: u64,
    pub reads: u64,
    pub writes: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    /// `success_rate * 1000 / (1 + avg_latency_ms)`
    pub score: f64,
}

#[derive(Debug, Default)]
struct KeyCounters {
    flat: EncodingCounters,
    structured: EncodingCounters,
}

impl KeyCounters {
    fn for_kind(&self, kind: EncodingKind) -> Option<&EncodingCounters> {
        match kind {
            EncodingKind::Flat => Some(&self.flat),
            EncodingKind::Structured => Some(&self.structured),
            EncodingKind::Auto => None,
        }
    }
}

/// One key's line in a [`PerformanceReport`]
#[derive(Debug, Clone, Serialize)]
pub struct KeyPerformance {
    pub key: String,
    pub flat: EncodingStats,
    pub structured: EncodingStats,
    pub recommended: EncodingKind,
}

/// Snapshot of every observed key
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub keys: Vec<KeyPerformance>,
}

/// Scores flat against structured storage per key
#[derive(Debug, Default)]
pub struct PerformanceLedger {
    entries: RwLock<HashMap<String, Arc<KeyCounters>>>,
}

impl PerformanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, key: &str, kind: EncodingKind, latency_ms: f64, success: bool) {
        self.record(key, kind, latency_ms, success, false);
    }

    pub fn record_write(&self, key: &str, kind: EncodingKind, latency_ms: f64, success: bool) {
        self.record(key, kind, latency_ms, success, true);
    }

    fn record(&self, key: &str, kind: EncodingKind, latency_ms: f64, success: bool, is_write: bool) {
        if kind == EncodingKind::Auto {
            debug!("Ignoring observation for unresolved encoding on key {}", key);
            return;
        }

        let counters = self.counters(key);
        if let Some(bucket) = counters.for_kind(kind) {
            bucket.record(latency_ms, success, is_write);
        }
    }

    /// Existing counters for `key`, created on first use
    fn counters(&self, key: &str) -> Arc<KeyCounters> {
        if let Some(counters) = self.entries.read().get(key) {
            return counters.clone();
        }
        self.entries
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// STRUCTURED only when its score is strictly higher than FLAT's
    pub fn recommend(&self, key: &str) -> EncodingKind {
        let Some(counters) = self.entries.read().get(key).cloned() else {
            return EncodingKind::Flat;
        };
        Self::recommend_from(&counters.flat.snapshot(), &counters.structured.snapshot())
    }

    fn recommend_from(flat: &EncodingStats, structured: &EncodingStats) -> EncodingKind {
        if structured.score > flat.score {
            EncodingKind::Structured
        } else {
            EncodingKind::Flat
        }
    }

    pub fn has_observations(&self, key: &str) -> bool {
        self.entries.read().get(key).is_some_and(|counters| {
            counters.flat.observations.load(Ordering::Relaxed) > 0
                || counters.structured.observations.load(Ordering::Relaxed) > 0
        })
    }

    /// Statistics for one encoding of one key
    pub fn stats(&self, key: &str, kind: EncodingKind) -> Option<EncodingStats> {
        let counters = self.entries.read().get(key).cloned()?;
        counters.for_kind(kind).map(EncodingCounters::snapshot)
    }

    /// Drop everything recorded for `key`
    pub fn forget(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Both encodings' statistics and the recommendation for every observed key
    pub fn report(&self) -> PerformanceReport {
        let snapshot: Vec<(String, Arc<KeyCounters>)> = self
            .entries
            .read()
            .iter()
            .map(|(key, counters)| (key.clone(), counters.clone()))
            .collect();

        let mut keys: Vec<KeyPerformance> = snapshot
            .into_iter()
            .map(|(key, counters)| {
                let flat = counters.flat.snapshot();
                let structured = counters.structured.snapshot();
                let recommended = Self::recommend_from(&flat, &structured);
                KeyPerformance {
                    key,
                    flat,
                    structured,
                    recommended,
                }
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        PerformanceReport {
            generated_at: Utc::now(),
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_observations_recommends_flat() {
        let ledger = PerformanceLedger::new();
        assert_eq!(ledger.recommend("unknown"), EncodingKind::Flat);
        assert!(!ledger.has_observations("unknown"));
    }

    #[test]
    fn test_strictly_higher_score_wins() {
        let ledger = PerformanceLedger::new();
        ledger.record_write("k", EncodingKind::Flat, 10.0, true);
        ledger.record_write("k", EncodingKind::Structured, 1.0, true);
        assert_eq!(ledger.recommend("k"), EncodingKind::Structured);

        let ledger = PerformanceLedger::new();
        ledger.record_write("k", EncodingKind::Flat, 1.0, true);
        ledger.record_write("k", EncodingKind::Structured, 10.0, true);
        assert_eq!(ledger.recommend("k"), EncodingKind::Flat);
    }

    #[test]
    fn test_tie_goes_to_flat() {
        let ledger = PerformanceLedger::new();
        ledger.record_read("k", EncodingKind::Flat, 2.0, true);
        ledger.record_read("k", EncodingKind::Structured, 2.0, true);
        assert_eq!(ledger.recommend("k"), EncodingKind::Flat);
    }

    #[test]
    fn test_failures_lower_the_score() {
        let ledger = PerformanceLedger::new();
        ledger.record_write("k", EncodingKind::Flat, 1.0, false);
        ledger.record_write("k", EncodingKind::Structured, 5.0, true);
        assert_eq!(ledger.recommend("k"), EncodingKind::Structured);

        let flat = ledger.stats("k", EncodingKind::Flat).unwrap();
        assert_eq!(flat.success_rate, 0.0);
        assert_eq!(flat.score, 0.0);
    }

    #[test]
    fn test_negative_latency_clamped() {
        let ledger = PerformanceLedger::new();
        ledger.record_write("k", EncodingKind::Flat, -5.0, true);
        let stats = ledger.stats("k", EncodingKind::Flat).unwrap();
        assert_eq!(stats.avg_latency_ms, 0.0);
        assert_eq!(stats.score, 1000.0);
    }

    #[test]
    fn test_stats_math() {
        let ledger = PerformanceLedger::new();
        ledger.record_write("k", EncodingKind::Structured, 2.0, true);
        ledger.record_read("k", EncodingKind::Structured, 4.0, false);

        let stats = ledger.stats("k", EncodingKind::Structured).unwrap();
        assert_eq!(stats.observations, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert!((stats.avg_latency_ms - 3.0).abs() < 1e-9);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert!((stats.score - 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_auto_is_not_recorded() {
        let ledger = PerformanceLedger::new();
        ledger.record_write("k", EncodingKind::Auto, 1.0, true);
        assert!(!ledger.has_observations("k"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_report_and_forget() {
        let ledger = PerformanceLedger::new();
        ledger.record_write("b", EncodingKind::Flat, 1.0, true);
        ledger.record_write("a", EncodingKind::Structured, 1.0, true);

        let report = ledger.report();
        assert_eq!(report.keys.len(), 2);
        assert_eq!(report.keys[0].key, "a");
        assert_eq!(report.keys[0].recommended, EncodingKind::Structured);
        assert_eq!(report.keys[1].recommended, EncodingKind::Flat);

        // Reporting has no side effects
        assert_eq!(ledger.report().keys.len(), 2);

        assert!(ledger.forget("a"));
        assert!(!ledger.forget("a"));
        assert_eq!(ledger.report().keys.len(), 1);
        assert_eq!(ledger.recommend("a"), EncodingKind::Flat);
    }

    #[test]
    fn test_concurrent_recording() {
        let ledger = Arc::new(PerformanceLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ledger.record_read("hot", EncodingKind::Flat, 1.0, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = ledger.stats("hot", EncodingKind::Flat).unwrap();
        assert_eq!(stats.observations, 8000);
    }
}
