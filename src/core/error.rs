//! # Error Handling
//!
//! All fallible operations in the crate return [`CacheResult`]. The variants follow the
//! failure classes the cache layer can observe:
//!
//! - `Transport`: network or HTTP failure reported by the transport primitive
//! - `Configuration`: unknown profile names, invalid config files, bad env overrides
//! - `RetryExhausted`: the client-side retry budget was consumed
//! - `Store`, `Serialization`, `Producer`: failures inside the cache itself
//!
//! `CacheError` is `Clone` because a single in-flight computation can have many waiters,
//! and every one of them receives the same outcome.

use thiserror::Error;

/// Result type used throughout the crate
pub type CacheResult<T> = Result<T, CacheError>;

/// Error taxonomy for the cache orchestration layer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    /// Network or HTTP failure from the underlying transport
    #[error("Transport error for {url}: {message}")]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// Unknown profile name or invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Client-side retry budget consumed
    #[error("Retry budget exhausted for {key} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        key: String,
        attempts: u32,
        last_error: Box<CacheError>,
    },

    /// Cache store backend failure
    #[error("Cache store error: {message}")]
    Store { message: String },

    /// Value could not be converted to or from its stored form
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// A cached query producer failed for a non-transport reason
    #[error("Producer error: {message}")]
    Producer { message: String },
}

impl CacheError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transport error without an HTTP status (connection failures, timeouts)
    pub fn transport<U: Into<String>, S: Into<String>>(url: U, message: S) -> Self {
        Self::Transport {
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Create a transport error classified by HTTP status
    pub fn http_status<U: Into<String>, S: Into<String>>(url: U, status: u16, message: S) -> Self {
        Self::Transport {
            url: url.into(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a producer error with a custom message
    pub fn producer<S: Into<String>>(message: S) -> Self {
        Self::Producer {
            message: message.into(),
        }
    }

    /// Wrap the final failure of a retried fetch
    pub fn retry_exhausted<K: Into<String>>(key: K, attempts: u32, last_error: CacheError) -> Self {
        Self::RetryExhausted {
            key: key.into(),
            attempts,
            last_error: Box::new(last_error),
        }
    }

    /// HTTP status attached to a transport error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            Self::RetryExhausted { last_error, .. } => last_error.status(),
            _ => None,
        }
    }

    /// Get error type as string for log fields and metric labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::Configuration { .. } => "configuration_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Store { .. } => "store_error",
            Self::Serialization { .. } => "serialization_error",
            Self::Producer { .. } => "producer_error",
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        match err.status() {
            Some(status) => Self::http_status(url, status.as_u16(), err.to_string()),
            None => Self::transport(url, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_passes_through_retry_exhaustion() {
        let inner = CacheError::http_status("/api/posts", 503, "service unavailable");
        let err = CacheError::retry_exhausted("/api/posts", 4, inner);

        assert_eq!(err.status(), Some(503));
        assert_eq!(err.error_type(), "retry_exhausted");
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let err: CacheError = serde_json::from_str::<u32>("not a number").unwrap_err().into();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }
}
