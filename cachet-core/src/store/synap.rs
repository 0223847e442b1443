//! Synap server adapter
//!
//! Talks StreamableHTTP (`POST /api/v1/command`) to a Synap server.
//!
//! Synap keeps strings and hashes in separate namespaces, and its hashes have
//! neither expiry nor key listing. The adapter papers over that:
//! - a hash carries its deadline (unix millis) in the reserved `@expires` field
//!   and is dropped lazily once that passes
//! - every hash has an index key `__cachet:hash:<key>` in the string namespace
//!   so pattern scans can find it
//!
//! Lock acquisition and release run as Lua scripts so they are atomic on the
//! server.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::pattern::{glob_match, literal_prefix};
use super::{KeyKind, KvBackend, ScanPage, TtlState};
use crate::config::BackendConfig;
use crate::error::{CacheError, Result};

const EXPIRES_FIELD: &str = "@expires";
const HASH_INDEX_PREFIX: &str = "__cachet:hash:";

/// Size commands for the structures the cache never writes: (command, count field, type name)
const OTHER_KINDS: [(&str, &str, &str); 3] = [
    ("list.len", "length", "list"),
    ("set.card", "cardinality", "set"),
    ("sortedset.zcard", "count", "zset"),
];

const SET_NX_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) then
  return 0
end
redis.call('set', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
end
return 0
"#;

const TTL_SCRIPT: &str = "return redis.call('ttl', KEYS[1])";

/// Synap connection settings
#[derive(Debug, Clone)]
pub struct SynapConfig {
    /// Base URL of the Synap server
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional authentication token
    pub auth_token: Option<String>,
}

impl SynapConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            auth_token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

impl From<&BackendConfig> for SynapConfig {
    fn from(config: &BackendConfig) -> Self {
        let mut synap = SynapConfig::new(config.url.clone()).with_timeout(config.timeout());
        if let Some(token) = &config.auth_token {
            synap = synap.with_auth_token(token.clone());
        }
        synap
    }
}

/// [`KvBackend`] backed by a remote Synap server
#[derive(Clone)]
pub struct SynapStore {
    config: Arc<SynapConfig>,
    http_client: Client,
    base_url: Url,
}

impl SynapStore {
    pub fn new(config: SynapConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;

        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(ref token) = config.auth_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| CacheError::Config("auth_token is not a valid header value".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            config: Arc::new(config),
            http_client: builder.build()?,
            base_url,
        })
    }

    pub fn config(&self) -> &SynapConfig {
        &self.config
    }

    /// Send one StreamableHTTP command and return its payload
    async fn send_command(&self, command: &str, payload: Value) -> Result<Value> {
        let body = json!({
            "command": command,
            "request_id": uuid::Uuid::new_v4().to_string(),
            "payload": payload,
        });

        let url = self.base_url.join("api/v1/command")?;
        let response = self.http_client.post(url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CacheError::StoreUnavailable(format!(
                "{} returned {}: {}",
                command, status, text
            )));
        }

        let result: Value = response.json().await?;
        if !result["success"].as_bool().unwrap_or(false) {
            let message = result["error"].as_str().unwrap_or("Unknown error");
            return Err(CacheError::Backend(format!("{}: {}", command, message)));
        }

        Ok(result["payload"].clone())
    }

    async fn eval(&self, script: &str, keys: &[&str], args: Vec<Value>) -> Result<Value> {
        let payload = json!({
            "script": script,
            "keys": keys,
            "args": args,
        });
        let response = self.send_command("script.eval", payload).await?;
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    fn index_key(key: &str) -> String {
        format!("{}{}", HASH_INDEX_PREFIX, key)
    }

    /// Read a hash, dropping it if its deadline has passed.
    /// Returns the user fields and the deadline in unix millis.
    async fn load_hash(&self, key: &str) -> Result<Option<(HashMap<String, String>, Option<i64>)>> {
        let response = self
            .send_command("hash.getall", json!({ "key": key }))
            .await?;

        let mut fields: HashMap<String, String> = response
            .get("fields")
            .and_then(|v| v.as_object())
            .map(|object| {
                object
                    .iter()
                    .map(|(field, value)| (field.clone(), value_text(value)))
                    .collect()
            })
            .unwrap_or_default();

        let deadline = fields
            .remove(EXPIRES_FIELD)
            .and_then(|raw| raw.parse::<i64>().ok());

        if deadline.is_some_and(|deadline| deadline <= Utc::now().timestamp_millis()) {
            debug!("Hash {} passed its deadline, dropping", key);
            self.drop_hash(key).await?;
            return Ok(None);
        }

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some((fields, deadline)))
    }

    /// Remove a hash and its index key. Returns whether a hash existed.
    async fn drop_hash(&self, key: &str) -> Result<bool> {
        let response = self
            .send_command("hash.getall", json!({ "key": key }))
            .await?;
        let fields: Vec<String> = response
            .get("fields")
            .and_then(|v| v.as_object())
            .map(|object| object.keys().cloned().collect())
            .unwrap_or_default();

        self.send_command("kv.del", json!({ "key": Self::index_key(key) }))
            .await?;

        if fields.is_empty() {
            return Ok(false);
        }
        self.send_command("hash.del", json!({ "key": key, "fields": fields }))
            .await?;
        Ok(true)
    }

    /// Fetch up to `limit` string-namespace keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let response = self
            .send_command("kv.scan", json!({ "prefix": prefix, "limit": limit }))
            .await?;
        Ok(response
            .get("keys")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default())
    }
}

/// Synap returns JSON-decoded values; turn one back into the text we wrote
fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Synap TTLs are whole seconds; round up so short leases never become 0
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_millis().div_ceil(1000).max(1) as u64
}

#[async_trait]
impl KvBackend for SynapStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self.send_command("kv.get", json!({ "key": key })).await?;
        match response {
            Value::Null => Ok(None),
            // kv.get hands back the stored JSON text of the value we sent
            Value::String(raw) => Ok(Some(
                serde_json::from_str::<String>(&raw).unwrap_or(raw),
            )),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let payload = json!({
            "key": key,
            "value": value,
            "ttl": ttl.map(ttl_seconds),
        });
        self.send_command("kv.set", payload).await?;

        let index = self
            .send_command("kv.del", json!({ "key": Self::index_key(key) }))
            .await?;
        if index["deleted"].as_bool().unwrap_or(false) {
            self.drop_hash(key).await?;
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result = self
            .eval(SET_NX_SCRIPT, &[key], vec![json!(value), json!(ttl_seconds(ttl))])
            .await?;
        Ok(result.as_i64().unwrap_or(0) == 1)
    }

    async fn mset(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        let pairs: Vec<Value> = entries
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.send_command("kv.mset", json!({ "pairs": pairs })).await?;

        // kv.mset has no TTL argument
        if let Some(ttl) = ttl {
            let seconds = ttl_seconds(ttl);
            for (key, _) in entries {
                self.send_command("kv.expire", json!({ "key": key, "ttl": seconds }))
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response = self.send_command("kv.del", json!({ "key": key })).await?;
        let string_deleted = response["deleted"].as_bool().unwrap_or(false);
        let hash_deleted = self.drop_hash(key).await?;
        Ok(string_deleted || hash_deleted)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let response = self.send_command("kv.mdel", json!({ "keys": keys })).await?;
        let mut deleted = response["deleted"].as_u64().unwrap_or(0) as usize;

        for key in keys {
            if self.drop_hash(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let seconds = ttl_seconds(ttl);
        let response = self
            .send_command("kv.expire", json!({ "key": key, "ttl": seconds }))
            .await;
        match response {
            Ok(value) if value["result"].as_bool().unwrap_or(false) => return Ok(true),
            Ok(_) => {}
            // Synap reports a missing string key as an error
            Err(CacheError::Backend(message)) => debug!("kv.expire {}: {}", key, message),
            Err(e) => return Err(e),
        }

        if self.load_hash(key).await?.is_none() {
            return Ok(false);
        }
        let deadline = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self.send_command(
            "hash.mset",
            json!({ "key": key, "fields": { EXPIRES_FIELD: deadline.to_string() } }),
        )
        .await?;
        self.send_command(
            "kv.expire",
            json!({ "key": Self::index_key(key), "ttl": seconds }),
        )
        .await?;
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<TtlState> {
        let result = self.eval(TTL_SCRIPT, &[key], Vec::new()).await?;
        let seconds = result.as_i64().unwrap_or(-2);
        if seconds != -2 {
            return Ok(TtlState::from_seconds(seconds));
        }

        Ok(match self.load_hash(key).await? {
            None => TtlState::Missing,
            Some((_, None)) => TtlState::Persistent,
            Some((_, Some(deadline))) => {
                let left = (deadline - Utc::now().timestamp_millis()).max(0) as u64;
                TtlState::Expires(Duration::from_secs(left.div_ceil(1000)))
            }
        })
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        if self.get(key).await?.is_some() {
            return Ok(KeyKind::String);
        }
        if self.load_hash(key).await?.is_some() {
            return Ok(KeyKind::Hash);
        }
        for (command, count_field, name) in OTHER_KINDS {
            let response = self.send_command(command, json!({ "key": key })).await?;
            if response.get(count_field).and_then(|v| v.as_u64()).unwrap_or(0) > 0 {
                return Ok(KeyKind::Other(name.to_string()));
            }
        }
        Ok(KeyKind::None)
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.iter().any(|(field, _)| field == EXPIRES_FIELD) {
            return Err(CacheError::InvalidField(format!(
                "{} is reserved by the Synap adapter",
                EXPIRES_FIELD
            )));
        }

        let object: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(field, value)| (field.clone(), Value::String(value.clone())))
            .collect();
        self.send_command("hash.mset", json!({ "key": key, "fields": object }))
            .await?;
        self.send_command(
            "kv.set",
            json!({ "key": Self::index_key(key), "value": "1", "ttl": null }),
        )
        .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .load_hash(key)
            .await?
            .map(|(fields, _)| fields)
            .unwrap_or_default())
    }

    async fn hash_multi_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let all = self.hash_get_all(key).await?;
        Ok(fields.iter().map(|field| all.get(field).cloned()).collect())
    }

    async fn hash_len(&self, key: &str) -> Result<usize> {
        Ok(self.hash_get_all(key).await?.len())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let result = self
            .eval(COMPARE_AND_DELETE_SCRIPT, &[key], vec![json!(expected)])
            .await?;
        Ok(result.as_i64().unwrap_or(0) > 0)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        // kv.scan has no cursor: re-read up to the end of the requested window
        // over the string keys followed by the hash index keys.
        let prefix = literal_prefix(pattern);
        let start = cursor as usize;
        let end = start + count.max(1);

        let strings = self.scan_prefix(&prefix, end).await?;
        let mut window: Vec<String> = strings;
        let mut exhausted = window.len() < end;
        if exhausted {
            let wanted = end - window.len();
            let hashes = self
                .scan_prefix(&Self::index_key(&prefix), wanted)
                .await?;
            exhausted = hashes.len() < wanted;
            window.extend(
                hashes
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(HASH_INDEX_PREFIX).map(str::to_string)),
            );
        }

        let keys: Vec<String> = window
            .into_iter()
            .skip(start)
            .filter(|key| !key.starts_with(HASH_INDEX_PREFIX) && glob_match(pattern, key))
            .collect();

        let next = if exhausted { 0 } else { end as u64 };
        Ok(ScanPage { cursor: next, keys })
    }
}
