use async_trait::async_trait;
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::pattern::{glob_match, literal_prefix};
use super::{KeyKind, KvBackend, ScanPage, TtlState};
use crate::error::{CacheError, Result};

/// Value held under a key
#[derive(Debug, Clone)]
enum Payload {
    Text(String),
    Hash(HashMap<String, String>),
}

/// Stored entry with expiry metadata
#[derive(Debug, Clone)]
struct StoredEntry {
    payload: Payload,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(payload: Payload, ttl: Option<Duration>) -> Self {
        Self {
            payload,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires| Instant::now() >= expires)
    }

    /// Remaining lifetime, rounded up to whole seconds
    fn ttl_state(&self) -> TtlState {
        match self.expires_at {
            None => TtlState::Persistent,
            Some(expires) => {
                let left = expires.saturating_duration_since(Instant::now());
                let secs = left.as_millis().div_ceil(1000) as u64;
                TtlState::Expires(Duration::from_secs(secs))
            }
        }
    }
}

/// In-process Redis-like store on a radix trie
///
/// Keys sharing a prefix share trie nodes, which keeps namespaced keyspaces
/// (`user:1`, `user:2`...) compact and lets pattern scans jump straight to
/// the literal prefix of the pattern.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<Trie<String, StoredEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start background TTL cleanup task
    pub fn start_ttl_cleanup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!("Starting TTL cleanup task (interval={:?})", interval);

        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }

    /// Drop every expired key, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut data = self.data.write();
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            data.remove(key);
        }
        if !expired.is_empty() {
            debug!("Purged {} expired keys", expired.len());
        }
        expired.len()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let data = self.data.read();
        data.iter().filter(|(_, entry)| !entry.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entry for `key`, dropping it first if it has expired
    fn live<'a>(data: &'a mut Trie<String, StoredEntry>, key: &str) -> Option<&'a mut StoredEntry> {
        if data.get(key).is_some_and(|entry| entry.is_expired()) {
            data.remove(key);
            return None;
        }
        data.get_mut(key)
    }

    fn wrong_type(key: &str) -> CacheError {
        CacheError::Backend(format!(
            "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
            key
        ))
    }
}

#[async_trait]
impl KvBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.write();
        match Self::live(&mut data, key) {
            Some(entry) => match &entry.payload {
                Payload::Text(text) => Ok(Some(text.clone())),
                Payload::Hash(_) => Err(Self::wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        debug!("SET key={}, size={}, ttl={:?}", key, value.len(), ttl);
        let entry = StoredEntry::new(Payload::Text(value.to_string()), ttl);
        self.data.write().insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut data = self.data.write();
        if Self::live(&mut data, key).is_some() {
            return Ok(false);
        }
        let entry = StoredEntry::new(Payload::Text(value.to_string()), Some(ttl));
        data.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn mset(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        debug!("MSET count={}, ttl={:?}", entries.len(), ttl);
        let mut data = self.data.write();
        for (key, value) in entries {
            data.insert(
                key.clone(),
                StoredEntry::new(Payload::Text(value.clone()), ttl),
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        debug!("DELETE key={}", key);
        let removed = self.data.write().remove(key);
        Ok(removed.is_some_and(|entry| !entry.is_expired()))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        debug!("MDEL count={}", keys.len());
        let mut data = self.data.write();
        let count = keys
            .iter()
            .filter_map(|key| data.remove(key))
            .filter(|entry| !entry.is_expired())
            .count();
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut data = self.data.write();
        match Self::live(&mut data, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<TtlState> {
        let mut data = self.data.write();
        Ok(Self::live(&mut data, key)
            .map(|entry| entry.ttl_state())
            .unwrap_or(TtlState::Missing))
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        let mut data = self.data.write();
        Ok(match Self::live(&mut data, key) {
            Some(StoredEntry {
                payload: Payload::Text(_),
                ..
            }) => KeyKind::String,
            Some(StoredEntry {
                payload: Payload::Hash(_),
                ..
            }) => KeyKind::Hash,
            None => KeyKind::None,
        })
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        debug!("HMSET key={}, fields={}", key, fields.len());
        let mut data = self.data.write();
        match Self::live(&mut data, key) {
            Some(entry) => match &mut entry.payload {
                Payload::Hash(map) => {
                    map.extend(fields.iter().cloned());
                    Ok(())
                }
                Payload::Text(_) => Err(Self::wrong_type(key)),
            },
            None => {
                let map: HashMap<String, String> = fields.iter().cloned().collect();
                data.insert(key.to_string(), StoredEntry::new(Payload::Hash(map), None));
                Ok(())
            }
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut data = self.data.write();
        match Self::live(&mut data, key) {
            Some(entry) => match &entry.payload {
                Payload::Hash(map) => Ok(map.clone()),
                Payload::Text(_) => Err(Self::wrong_type(key)),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_multi_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let mut data = self.data.write();
        match Self::live(&mut data, key) {
            Some(entry) => match &entry.payload {
                Payload::Hash(map) => Ok(fields.iter().map(|f| map.get(f).cloned()).collect()),
                Payload::Text(_) => Err(Self::wrong_type(key)),
            },
            None => Ok(vec![None; fields.len()]),
        }
    }

    async fn hash_len(&self, key: &str) -> Result<usize> {
        let mut data = self.data.write();
        match Self::live(&mut data, key) {
            Some(entry) => match &entry.payload {
                Payload::Hash(map) => Ok(map.len()),
                Payload::Text(_) => Err(Self::wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut data = self.data.write();
        let owned = matches!(
            Self::live(&mut data, key),
            Some(StoredEntry { payload: Payload::Text(current), .. }) if current == expected
        );
        if owned {
            data.remove(key);
        }
        Ok(owned)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        debug!("SCAN cursor={}, pattern={}, count={}", cursor, pattern, count);

        let prefix = literal_prefix(pattern);
        let data = self.data.read();
        let candidates: Vec<(&String, &StoredEntry)> = if prefix.is_empty() {
            data.iter().collect()
        } else {
            data.get_raw_descendant(&prefix)
                .map(|subtrie| subtrie.iter().collect())
                .unwrap_or_default()
        };

        // The cursor is an offset into the (ordered) candidate list
        let start = cursor as usize;
        let end = start.saturating_add(count.max(1)).min(candidates.len());
        let keys = candidates
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
            .map(|(key, _)| (*key).clone())
            .collect();

        let next = if end >= candidates.len() { 0 } else { end as u64 };
        Ok(ScanPage { cursor: next, keys })
    }
}
