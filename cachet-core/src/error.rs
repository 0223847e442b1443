//! Error types for the caching engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cachet error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Transport or connection failure talking to the KV backend
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Backend answered but rejected the command (WRONGTYPE, script error, ...)
    #[error("Backend error: {0}")]
    Backend(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored representation does not match what the caller asked for
    #[error("Encoding mismatch for key '{key}': {detail}")]
    EncodingMismatch { key: String, detail: String },

    /// Field name that cannot be written to a structured entry
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// Some entries of a batch write could not be stored
    #[error("Batch write failed for {} of {total} entries: {}", .failed.len(), .failed.join(", "))]
    PartialBatch { failed: Vec<String>, total: usize },

    /// The caller-supplied loader failed
    #[error("Loader failed for key '{key}': {source}")]
    Loader {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid backend URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CacheError {
    /// Whether the error came from talking to the backend rather than from
    /// the caller's data or configuration.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Backend(_))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::StoreUnavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "Store unavailable: connection refused");

        let err = CacheError::PartialBatch {
            failed: vec!["a".to_string(), "b".to_string()],
            total: 5,
        };
        assert_eq!(err.to_string(), "Batch write failed for 2 of 5 entries: a, b");
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(CacheError::StoreUnavailable("x".into()).is_store_failure());
        assert!(CacheError::Backend("WRONGTYPE".into()).is_store_failure());
        assert!(!CacheError::Config("bad".into()).is_store_failure());
        assert!(
            !CacheError::EncodingMismatch {
                key: "k".into(),
                detail: "d".into()
            }
            .is_store_failure()
        );
    }
}
