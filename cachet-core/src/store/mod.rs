//! Key-value backends
//!
//! The engine never talks to a concrete store directly. Everything goes
//! through [`KvBackend`], a Redis-shaped surface: string values with TTLs,
//! hashes, key-type introspection, set-if-absent, compare-and-delete and a
//! cursor scan.
//!
//! - [`MemoryStore`]: in-process radix-trie keyspace
//! - [`SynapStore`]: remote Synap server over StreamableHTTP

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

pub mod memory;
pub mod pattern;
pub mod synap;

pub use memory::MemoryStore;
pub use pattern::{glob_match, literal_prefix};
pub use synap::{SynapConfig, SynapStore};

/// Physical type of a key (Redis-compatible)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum KeyKind {
    /// Key does not exist (or expired)
    None,
    String,
    Hash,
    /// Any other structure (list, set, zset...)
    Other(String),
}

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlState {
    Missing,
    Persistent,
    Expires(Duration),
}

impl TtlState {
    /// Redis `TTL` convention: -2 missing, -1 no expiry, otherwise seconds left
    pub fn as_seconds(&self) -> i64 {
        match self {
            Self::Missing => -2,
            Self::Persistent => -1,
            Self::Expires(left) => left.as_secs() as i64,
        }
    }

    /// Inverse of [`TtlState::as_seconds`]
    pub fn from_seconds(secs: i64) -> Self {
        match secs {
            -2 => Self::Missing,
            s if s < 0 => Self::Persistent,
            s => Self::Expires(Duration::from_secs(s as u64)),
        }
    }
}

/// One round of a cursor scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next round, 0 when the iteration is complete
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Redis-like store surface consumed by the engine
///
/// Values are text. Implementations must make `set_nx` and
/// `compare_and_delete` atomic with respect to each other.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a string value, replacing whatever the key held
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Store only if the key is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn mset(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn delete_many(&self, keys: &[String]) -> Result<usize>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<TtlState>;

    async fn key_kind(&self, key: &str) -> Result<KeyKind>;

    /// Write (merge) fields into a hash, creating it if needed
    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// All fields of a hash, empty when the key is absent
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Values for `fields` in order, `None` for fields that do not exist
    async fn hash_multi_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    async fn hash_len(&self, key: &str) -> Result<usize>;

    /// Delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Incremental, non-blocking iteration over keys matching a glob pattern.
    /// Start with cursor 0; a returned cursor of 0 ends the iteration.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage>;
}
