//! Direct cache operations
//!
//! The router picks an encoding for every write, stores the value in that
//! representation, and reads entries back based on the physical key type.
//! Each store round-trip is timed and fed to the [`PerformanceLedger`].

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::classifier::{EncodingKind, StorageClassifier};
use super::codec::{FieldMap, StructuralCodec, TYPE_FIELD, TypedValue};
use super::ledger::PerformanceLedger;
use crate::error::{CacheError, Result};
use crate::store::{KeyKind, KvBackend};

/// What `inspect` found under a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEncoding {
    NotFound,
    Flat,
    Structured,
    /// A key of another physical type
    Unknown,
    /// The store could not be queried
    Error,
}

impl fmt::Display for EntryEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryEncoding::NotFound => "NOT_FOUND",
            EntryEncoding::Flat => "FLAT",
            EntryEncoding::Structured => "STRUCTURED",
            EntryEncoding::Unknown => "UNKNOWN",
            EntryEncoding::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl Serialize for EntryEncoding {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Result of [`CacheRouter::inspect`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub encoding: EntryEncoding,
    /// Bytes for flat entries, field count for structured ones
    pub size: usize,
    /// -2 missing, -1 no expiry, otherwise seconds left
    pub ttl_seconds: i64,
}

/// A value read without naming its type
#[derive(Debug)]
pub enum CachedValue {
    /// Structured entry rebuilt through the type registry
    Typed(TypedValue),
    /// Structured entry whose type is not registered
    Fields(HashMap<String, Value>),
    /// Flat entry
    Flat(Value),
}

/// An entry as it sits in the store
#[derive(Debug)]
pub(crate) enum RawEntry {
    Missing,
    Flat(String),
    Structured(FieldMap),
    Other(String),
}

/// Zero means "no expiry"
fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| !ttl.is_zero())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Entry point for direct get/set/delete
#[derive(Clone)]
pub struct CacheRouter {
    backend: Arc<dyn KvBackend>,
    classifier: StorageClassifier,
    codec: StructuralCodec,
    ledger: Arc<PerformanceLedger>,
}

impl CacheRouter {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        classifier: StorageClassifier,
        codec: StructuralCodec,
        ledger: Arc<PerformanceLedger>,
    ) -> Self {
        Self {
            backend,
            classifier,
            codec,
            ledger,
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn classifier(&self) -> &StorageClassifier {
        &self.classifier
    }

    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    /// Store `value` with the encoding chosen by the classifier.
    /// Returns the encoding actually used.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<EncodingKind> {
        let kind = self.classifier.classify(key, value);
        self.write(key, value, effective_ttl(ttl), kind).await
    }

    /// Store `value` with a caller-chosen encoding. `Auto` follows the
    /// ledger once the key has been observed, and the classifier before that.
    pub async fn set_with_encoding<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        encoding: EncodingKind,
    ) -> Result<EncodingKind> {
        let kind = match encoding {
            EncodingKind::Auto => self.resolve_auto(key, value),
            forced => forced,
        };
        self.write(key, value, effective_ttl(ttl), kind).await
    }

    fn resolve_auto<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> EncodingKind {
        if self.ledger.has_observations(key) {
            self.ledger.recommend(key)
        } else {
            self.classifier.classify(key, value)
        }
    }

    async fn write<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        kind: EncodingKind,
    ) -> Result<EncodingKind> {
        if kind == EncodingKind::Structured {
            match StructuralCodec::to_field_map(value) {
                Some(map) if !map.is_empty() => {
                    self.write_structured(key, &map, ttl).await?;
                    return Ok(EncodingKind::Structured);
                }
                _ => warn!(
                    "Structured encoding unavailable for key {}, storing flat",
                    key
                ),
            }
        }

        let start = Instant::now();
        let text = match serde_json::to_string(value) {
            Ok(text) => text,
            Err(e) => {
                self.ledger
                    .record_write(key, EncodingKind::Flat, elapsed_ms(start), false);
                error!("SET {} failed: cannot serialize value: {}", key, e);
                return Err(e.into());
            }
        };
        self.write_flat(key, &text, ttl).await?;
        Ok(EncodingKind::Flat)
    }

    async fn write_flat(&self, key: &str, text: &str, ttl: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let result = self.backend.set(key, text, ttl).await;
        self.ledger
            .record_write(key, EncodingKind::Flat, elapsed_ms(start), result.is_ok());

        match result {
            Ok(()) => {
                debug!("SET {} flat ({} bytes, ttl {:?})", key, text.len(), ttl);
                Ok(())
            }
            Err(e) => {
                error!("SET {} flat failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Replace the key with a field map, TTL on the whole key
    async fn write_structured(&self, key: &str, map: &FieldMap, ttl: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let result = async {
            // Drop the old entry so stale fields and a flat value cannot linger
            self.backend.delete(key).await?;
            self.backend.hash_set_all(key, &map.to_wire()).await?;
            if let Some(ttl) = ttl {
                self.backend.expire(key, ttl).await?;
            }
            Ok::<_, CacheError>(())
        }
        .await;
        self.ledger
            .record_write(key, EncodingKind::Structured, elapsed_ms(start), result.is_ok());

        match result {
            Ok(()) => {
                debug!("SET {} structured ({} fields, ttl {:?})", key, map.len(), ttl);
                Ok(())
            }
            Err(e) => {
                error!("SET {} structured failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Read an entry as `T`. Absence, decode failures and store failures all
    /// come back as `None`; the latter two are logged.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.read_entry(key).await {
            Ok(entry) => self.decode(key, entry),
            Err(e) => {
                warn!("GET {} failed, treating as absent: {}", key, e);
                None
            }
        }
    }

    /// Read an entry without naming its type
    pub async fn get_value(&self, key: &str) -> Option<CachedValue> {
        let entry = match self.read_entry(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("GET {} failed, treating as absent: {}", key, e);
                return None;
            }
        };

        match entry {
            RawEntry::Missing => None,
            RawEntry::Flat(text) => Some(CachedValue::Flat(
                serde_json::from_str(&text).unwrap_or(Value::String(text)),
            )),
            RawEntry::Structured(map) => match self.codec.reconstruct(&map) {
                Some(typed) => Some(CachedValue::Typed(typed)),
                None => {
                    debug!(
                        "No registered type {:?} for {}, returning raw fields",
                        map.type_name(),
                        key
                    );
                    Some(CachedValue::Fields(map.into_values()))
                }
            },
            RawEntry::Other(kind) => {
                warn!("GET {}: key holds a {}, not a cache entry", key, kind);
                None
            }
        }
    }

    /// Fetch the entry by physical key type, recording the read
    pub(crate) async fn read_entry(&self, key: &str) -> Result<RawEntry> {
        let start = Instant::now();
        let kind = match self.backend.key_kind(key).await {
            Ok(kind) => kind,
            Err(e) => {
                self.ledger
                    .record_read(key, EncodingKind::Flat, elapsed_ms(start), false);
                return Err(e);
            }
        };

        match kind {
            KeyKind::Hash => {
                let result = self.backend.hash_get_all(key).await;
                self.ledger.record_read(
                    key,
                    EncodingKind::Structured,
                    elapsed_ms(start),
                    result.is_ok(),
                );
                let fields = result?;
                if fields.is_empty() {
                    return Ok(RawEntry::Missing);
                }
                Ok(RawEntry::Structured(FieldMap::from_wire(fields)))
            }
            KeyKind::Other(name) => Ok(RawEntry::Other(name)),
            KeyKind::None => {
                self.ledger
                    .record_read(key, EncodingKind::Flat, elapsed_ms(start), true);
                Ok(RawEntry::Missing)
            }
            KeyKind::String => {
                let result = self.backend.get(key).await;
                self.ledger
                    .record_read(key, EncodingKind::Flat, elapsed_ms(start), result.is_ok());
                Ok(match result? {
                    Some(text) => RawEntry::Flat(text),
                    None => RawEntry::Missing,
                })
            }
        }
    }

    /// Turn a raw entry into `T`, falling back to best-effort conversions
    pub(crate) fn decode<T: DeserializeOwned>(&self, key: &str, entry: RawEntry) -> Option<T> {
        match entry {
            RawEntry::Missing => None,
            RawEntry::Flat(text) => match serde_json::from_str::<T>(&text) {
                Ok(value) => Some(value),
                // Text written by another client that is not JSON
                Err(e) => match serde_json::from_value::<T>(Value::String(text)) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("GET {}: flat value does not decode: {}", key, e);
                        None
                    }
                },
            },
            RawEntry::Structured(map) => {
                let decoded = StructuralCodec::from_field_map::<T>(&map);
                if decoded.is_none() {
                    let err = CacheError::EncodingMismatch {
                        key: key.to_string(),
                        detail: format!(
                            "stored {} does not match the requested type",
                            map.type_name().unwrap_or("untyped field map")
                        ),
                    };
                    warn!("GET {}: {}", key, err);
                }
                decoded
            }
            RawEntry::Other(kind) => {
                warn!("GET {}: key holds a {}, not a cache entry", key, kind);
                None
            }
        }
    }

    /// Read a subset of fields from a structured entry. Missing fields are
    /// left out; flat or absent entries give an empty map.
    pub async fn get_fields(&self, key: &str, fields: &[&str]) -> HashMap<String, Value> {
        if fields.is_empty() {
            return HashMap::new();
        }

        let start = Instant::now();
        match self.backend.key_kind(key).await {
            Ok(KeyKind::Hash) => {}
            Ok(kind) => {
                debug!("HMGET {}: not a structured entry ({:?})", key, kind);
                return HashMap::new();
            }
            Err(e) => {
                warn!("HMGET {} failed: {}", key, e);
                return HashMap::new();
            }
        }

        let names: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
        let result = self.backend.hash_multi_get(key, &names).await;
        self.ledger.record_read(
            key,
            EncodingKind::Structured,
            elapsed_ms(start),
            result.is_ok(),
        );

        match result {
            Ok(values) => names
                .into_iter()
                .zip(values)
                .filter_map(|(name, raw)| {
                    let raw = raw?;
                    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                    Some((name, value))
                })
                .collect(),
            Err(e) => {
                warn!("HMGET {} failed: {}", key, e);
                HashMap::new()
            }
        }
    }

    /// Update some fields of a structured entry, then apply `ttl` to the whole
    /// key. Fails as a whole.
    ///
    /// An absent key is created as a structured entry holding only `fields`.
    /// It carries no type discriminator, so untyped reads return it as a
    /// field map.
    pub async fn set_fields(
        &self,
        key: &str,
        fields: &[(&str, Value)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        if let Some((name, _)) = fields.iter().find(|(name, _)| *name == TYPE_FIELD) {
            return Err(CacheError::InvalidField(format!(
                "{} is reserved for the type discriminator",
                name
            )));
        }
        if fields.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let result = async {
            match self.backend.key_kind(key).await? {
                KeyKind::String => {
                    return Err(CacheError::EncodingMismatch {
                        key: key.to_string(),
                        detail: "cannot update fields of a flat entry".to_string(),
                    });
                }
                KeyKind::Other(kind) => {
                    return Err(CacheError::EncodingMismatch {
                        key: key.to_string(),
                        detail: format!("cannot update fields of a {}", kind),
                    });
                }
                KeyKind::None | KeyKind::Hash => {}
            }
            let wire: Vec<(String, String)> = fields
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            self.backend.hash_set_all(key, &wire).await?;
            if let Some(ttl) = effective_ttl(ttl) {
                self.backend.expire(key, ttl).await?;
            }
            Ok::<(), CacheError>(())
        }
        .await;
        self.ledger.record_write(
            key,
            EncodingKind::Structured,
            elapsed_ms(start),
            result.is_ok(),
        );

        if let Err(e) = &result {
            error!("HMSET {} ({} fields) failed: {}", key, fields.len(), e);
        }
        result
    }

    /// Store many entries. Flat entries go out in one bulk write, structured
    /// ones one by one. A failed bulk write is retried per key; entries that
    /// still fail are reported together.
    pub async fn multi_set<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = effective_ttl(ttl);
        let mut failed: Vec<String> = Vec::new();
        let mut flat: Vec<(String, String)> = Vec::new();

        for (key, value) in entries {
            if self.classifier.classify(key, value) == EncodingKind::Structured {
                match StructuralCodec::to_field_map(value) {
                    Some(map) if !map.is_empty() => {
                        if self.write_structured(key, &map, ttl).await.is_err() {
                            failed.push(key.clone());
                        }
                        continue;
                    }
                    _ => warn!("Structured encoding unavailable for key {}, storing flat", key),
                }
            }

            match serde_json::to_string(value) {
                Ok(text) => flat.push((key.clone(), text)),
                Err(e) => {
                    error!("MSET {} skipped: cannot serialize value: {}", key, e);
                    failed.push(key.clone());
                }
            }
        }

        if !flat.is_empty() {
            let start = Instant::now();
            match self.backend.mset(&flat, ttl).await {
                Ok(()) => {
                    let per_key = elapsed_ms(start) / flat.len() as f64;
                    for (key, _) in &flat {
                        self.ledger.record_write(key, EncodingKind::Flat, per_key, true);
                    }
                    debug!("MSET {} flat entries", flat.len());
                }
                Err(e) => {
                    warn!(
                        "Bulk write of {} entries failed, retrying per key: {}",
                        flat.len(),
                        e
                    );
                    for (key, text) in &flat {
                        if self.write_flat(key, text, ttl).await.is_err() {
                            failed.push(key.clone());
                        }
                    }
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            let err = CacheError::PartialBatch {
                failed,
                total: entries.len(),
            };
            error!("MSET: {}", err);
            Err(err)
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self.backend.delete(key).await.map_err(|e| {
            error!("DEL {} failed: {}", key, e);
            e
        })?;
        debug!("DEL {} -> {}", key, deleted);
        Ok(deleted)
    }

    /// Describe what is stored under `key`. Read-only; never fails.
    pub async fn inspect(&self, key: &str) -> EntryInfo {
        match self.try_inspect(key).await {
            Ok(info) => info,
            Err(e) => {
                warn!("INSPECT {} failed: {}", key, e);
                EntryInfo {
                    key: key.to_string(),
                    encoding: EntryEncoding::Error,
                    size: 0,
                    ttl_seconds: -2,
                }
            }
        }
    }

    async fn try_inspect(&self, key: &str) -> Result<EntryInfo> {
        let (encoding, size) = match self.backend.key_kind(key).await? {
            KeyKind::None => (EntryEncoding::NotFound, 0),
            KeyKind::String => {
                let size = self.backend.get(key).await?.map(|v| v.len()).unwrap_or(0);
                (EntryEncoding::Flat, size)
            }
            KeyKind::Hash => (EntryEncoding::Structured, self.backend.hash_len(key).await?),
            KeyKind::Other(_) => (EntryEncoding::Unknown, 0),
        };

        let ttl_seconds = if encoding == EntryEncoding::NotFound {
            -2
        } else {
            self.backend.ttl(key).await?.as_seconds()
        };

        Ok(EntryInfo {
            key: key.to_string(),
            encoding,
            size,
            ttl_seconds,
        })
    }
}
