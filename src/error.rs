//! Error types for the tiered cache and warming service

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache and warming layers
///
/// None of these escape `TieredCache::get`/`set`/`delete`; they are recorded
/// in metrics and the circuit breaker and surface only as misses or `false`.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Stored frame has an unknown or missing header
    #[error("Invalid cache frame: {0}")]
    InvalidFrame(String),

    // =========================================================================
    // Distributed Tier Errors
    // =========================================================================
    /// Generic distributed backend failure
    #[error("Distributed backend error: {0}")]
    Backend(String),

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Distributed operation exceeded its request timeout
    #[error("Distributed operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Circuit breaker refused the call
    #[error("Circuit breaker is open")]
    CircuitOpen,

    // =========================================================================
    // Warming Errors
    // =========================================================================
    /// A warming rule's refresh function failed
    #[error("Warming rule '{pattern}' failed: {reason}")]
    Warming { pattern: String, reason: String },

    /// External data source query failed
    #[error("Data source error: {0}")]
    DataSource(String),

    /// Predictor could not be trained
    #[error("Predictor training failed: {0}")]
    Training(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the remote tier was unreachable or unhealthy. Only these
    /// count against the circuit breaker; a reply the tier rejected does not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Backend(_) | Error::Timeout { .. } | Error::Io(_) => true,
            Error::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_cluster_error()
            }
            _ => false,
        }
    }

    /// Build a warming error for a rule pattern
    pub fn warming(pattern: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Warming {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }
}
