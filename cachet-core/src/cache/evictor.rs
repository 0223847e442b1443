//! Pattern-based invalidation
//!
//! Matching keys are collected with cursor scans (never a blocking full-key
//! listing), their refresh tasks are cancelled so nothing re-populates them,
//! and then they are deleted in batches.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::hotset::HotsetScheduler;
use super::ledger::PerformanceLedger;
use crate::store::KvBackend;

/// Outcome of one [`PatternEvictor::evict`] call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub pattern: String,
    /// Keys the scan yielded
    pub matched: usize,
    /// Keys the store reported as deleted
    pub deleted: usize,
    /// False when the scan or a delete batch failed part way
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PatternEvictor {
    backend: Arc<dyn KvBackend>,
    hotset: Arc<HotsetScheduler>,
    ledger: Arc<PerformanceLedger>,
    scan_batch: usize,
}

impl PatternEvictor {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        hotset: Arc<HotsetScheduler>,
        ledger: Arc<PerformanceLedger>,
        scan_batch: usize,
    ) -> Self {
        Self {
            backend,
            hotset,
            ledger,
            scan_batch: scan_batch.max(1),
        }
    }

    /// Remove every key matching the glob `pattern`.
    ///
    /// Never fails: store errors are logged and reported in the result.
    pub async fn evict(&self, pattern: &str) -> EvictionReport {
        let mut report = EvictionReport {
            pattern: pattern.to_string(),
            complete: true,
            ..EvictionReport::default()
        };

        let keys = self.collect(pattern, &mut report).await;
        report.matched = keys.len();
        if keys.is_empty() {
            debug!("EVICT {}: nothing matched", pattern);
            return report;
        }

        // Cancel first so a refresh cannot write a key back after deletion
        let cancelled = self.hotset.unregister_many(&keys).await;
        if cancelled > 0 {
            debug!("EVICT {}: cancelled {} refresh tasks", pattern, cancelled);
        }

        for batch in keys.chunks(self.scan_batch) {
            match self.backend.delete_many(batch).await {
                Ok(deleted) => report.deleted += deleted,
                Err(e) => {
                    error!(
                        "EVICT {}: deleting a batch of {} failed: {}",
                        pattern,
                        batch.len(),
                        e
                    );
                    report.complete = false;
                    report.error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        for key in &keys {
            self.ledger.forget(key);
        }

        info!(
            "EVICT {}: matched {}, deleted {}{}",
            pattern,
            report.matched,
            report.deleted,
            if report.complete { "" } else { " (partial)" }
        );
        report
    }

    /// Drain the cursor scan, deduplicating keys the store yields twice
    async fn collect(&self, pattern: &str, report: &mut EvictionReport) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor = 0;

        loop {
            match self.backend.scan(cursor, pattern, self.scan_batch).await {
                Ok(page) => {
                    for key in page.keys {
                        if seen.insert(key.clone()) {
                            keys.push(key);
                        }
                    }
                    if page.cursor == 0 {
                        break;
                    }
                    cursor = page.cursor;
                }
                Err(e) => {
                    warn!(
                        "EVICT {}: scan failed after {} keys, evicting what was found: {}",
                        pattern,
                        keys.len(),
                        e
                    );
                    report.complete = false;
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        keys
    }
}
