//! Caching layer on top of a [`KvBackend`](crate::store::KvBackend)
//!
//! - [`classifier`]: flat vs structured decision per write
//! - [`codec`]: values to and from field maps
//! - [`ledger`]: per-key encoding scores
//! - [`router`]: direct get/set/delete/inspect
//! - [`guard`]: cache-aside reads with stampede protection
//! - [`hotset`]: hot-key detection and background refresh
//! - [`evictor`]: glob-pattern invalidation

pub mod classifier;
pub mod codec;
pub mod evictor;
pub mod guard;
pub mod hotset;
pub mod ledger;
pub mod router;
pub mod shape;

pub use classifier::{EncodingKind, StorageClassifier};
pub use codec::{FieldMap, FieldValue, StructuralCodec, TYPE_FIELD, TypeRegistry, TypedValue};
pub use evictor::{EvictionReport, PatternEvictor};
pub use guard::{Loader, LockLease, StampedeGuard};
pub use hotset::{AccessStats, HotsetScheduler, RefreshJob, RefreshTaskInfo};
pub use ledger::{EncodingStats, KeyPerformance, PerformanceLedger, PerformanceReport};
pub use router::{CacheRouter, CachedValue, EntryEncoding, EntryInfo};
pub use shape::{ValueShape, probe};
