use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub classifier: ClassifierConfig,
    pub guard: GuardConfig,
    pub hotset: HotsetConfig,
    pub evictor: EvictorConfig,
    pub logging: LoggingConfig,
}

/// Which store the engine talks to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, nothing is shared between processes
    #[default]
    Memory,
    /// Remote Synap server over StreamableHTTP
    Synap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub url: String,
    pub timeout_ms: u64,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Key substrings that force structured storage for composite values
    pub entity_markers: Vec<String>,
    /// Smallest field count stored as a field map
    pub min_fields: usize,
    /// Largest field count stored as a field map
    pub max_fields: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub lock_prefix: String,
    pub lock_lease_ms: u64,
    pub retry_delay_ms: u64,
    pub null_sentinel: String,
    pub null_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotsetConfig {
    /// A key must be read strictly more often than this to become hot
    pub min_accesses: u64,
    /// ... and with a strictly higher hit rate than this
    pub min_hit_rate: f64,
    pub refresh_interval_ms: u64,
    /// Concurrent refresh jobs across all hot keys
    pub refresh_workers: usize,
    pub stats_horizon_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictorConfig {
    /// Keys requested per scan round
    pub scan_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            url: "http://localhost:15500".to_string(),
            timeout_ms: 5_000,
            auth_token: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            entity_markers: vec![":user:".to_string()],
            min_fields: 3,
            max_fields: 64,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lock_prefix: "lock:".to_string(),
            lock_lease_ms: 10_000,
            retry_delay_ms: 100,
            null_sentinel: "__NULL__".to_string(),
            null_ttl_secs: 300,
        }
    }
}

impl Default for HotsetConfig {
    fn default() -> Self {
        Self {
            min_accesses: 10,
            min_hit_rate: 0.8,
            refresh_interval_ms: 60_000,
            refresh_workers: 2,
            stats_horizon_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
        }
    }
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self { scan_batch: 100 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.classifier.min_fields > self.classifier.max_fields {
            return Err(CacheError::Config(format!(
                "classifier.min_fields ({}) exceeds classifier.max_fields ({})",
                self.classifier.min_fields, self.classifier.max_fields
            )));
        }
        if self.guard.lock_lease_ms == 0 {
            return Err(CacheError::Config(
                "guard.lock_lease_ms must be greater than 0".to_string(),
            ));
        }
        if self.guard.null_sentinel.is_empty() {
            return Err(CacheError::Config(
                "guard.null_sentinel must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hotset.min_hit_rate) {
            return Err(CacheError::Config(
                "hotset.min_hit_rate must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.hotset.refresh_workers == 0 {
            return Err(CacheError::Config(
                "hotset.refresh_workers must be greater than 0".to_string(),
            ));
        }
        if self.hotset.refresh_interval_ms == 0 {
            return Err(CacheError::Config(
                "hotset.refresh_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.evictor.scan_batch == 0 {
            return Err(CacheError::Config(
                "evictor.scan_batch must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl GuardConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn null_ttl(&self) -> Duration {
        Duration::from_secs(self.null_ttl_secs)
    }
}

impl HotsetConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn stats_horizon(&self) -> Duration {
        Duration::from_secs(self.stats_horizon_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.classifier.min_fields, 3);
        assert_eq!(config.classifier.max_fields, 64);
        assert_eq!(config.guard.lock_lease(), Duration::from_secs(10));
        assert_eq!(config.guard.retry_delay(), Duration::from_millis(100));
        assert_eq!(config.guard.null_ttl(), Duration::from_secs(300));
        assert_eq!(config.hotset.min_accesses, 10);
        assert_eq!(config.hotset.refresh_workers, 2);
        assert_eq!(config.hotset.stats_horizon(), Duration::from_secs(86_400));
        assert_eq!(config.evictor.scan_batch, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "backend:\n  kind: synap\n  url: http://cache:15500\nclassifier:\n  min_fields: 2\nlogging:\n  format: pretty"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Synap);
        assert_eq!(config.backend.url, "http://cache:15500");
        assert_eq!(config.backend.timeout_ms, 5_000);
        assert_eq!(config.classifier.min_fields, 2);
        assert_eq!(config.classifier.max_fields, 64);
        assert_eq!(config.classifier.entity_markers, vec![":user:".to_string()]);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_rejects_inverted_band() {
        let mut config = EngineConfig::default();
        config.classifier.min_fields = 10;
        config.classifier.max_fields = 5;
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_hit_rate() {
        let mut config = EngineConfig::default();
        config.hotset.min_hit_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.hotset.refresh_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let result = EngineConfig::from_file("/definitely/not/here.yml");
        assert!(matches!(result, Err(CacheError::Io(_))));
    }
}
