//! # Cachet
//!
//! Adaptive caching engine in front of a Redis-like key-value store.
//!
//! Each write is classified as *flat* (one serialized value) or *structured*
//! (a field map, readable field by field). Every store round-trip is timed and
//! scored per key so the better encoding can be picked automatically. Reads
//! can go through a stampede guard that lets one caller per key reload a
//! missing value, caches absences, and keeps frequently read keys fresh in the
//! background.
//!
//! ```no_run
//! use cachet_core::{CacheEngine, EngineConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> cachet_core::Result<()> {
//! let engine = CacheEngine::connect(EngineConfig::default())?;
//! engine.set("flag:enabled", &true, None).await?;
//!
//! let price: Option<f64> = engine
//!     .read(
//!         "price:42",
//!         || async { Ok(Some(9.99)) },
//!         Some(Duration::from_secs(300)),
//!         true,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;

pub use cache::{
    AccessStats, CacheRouter, CachedValue, EncodingKind, EntryEncoding, EntryInfo,
    EvictionReport, FieldMap, Loader, PatternEvictor, PerformanceLedger, PerformanceReport,
    RefreshJob, StampedeGuard, StorageClassifier, StructuralCodec, TypeRegistry, TypedValue,
};
pub use config::{BackendKind, EngineConfig};
pub use engine::CacheEngine;
pub use error::{CacheError, Result};
pub use store::{KeyKind, KvBackend, MemoryStore, ScanPage, SynapConfig, SynapStore, TtlState};
