//! Service Configuration
//!
//! Every recognized option for the tiered cache and the warming layer.
//! Configuration is immutable once the service is constructed; components
//! receive clones of the sub-config they need.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distributed tier connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Cluster endpoints (`redis://host:port`). Empty = memory-only mode.
    pub endpoints: Vec<String>,
    /// Optional password applied to every endpoint
    pub credential: Option<String>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Maximum write-behind writes in flight against the remote tier
    pub write_behind_concurrency: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            credential: None,
            request_timeout_ms: 500,
            write_behind_concurrency: 64,
        }
    }
}

impl DistributedConfig {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Memory tier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of resident entries
    pub capacity: usize,
    /// Interval between expiry sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl MemoryConfig {
    /// Expiry sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Value compression settings for the distributed tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress values crossing into the distributed tier
    pub enabled: bool,
    /// Serialized size (bytes) above which compression is attempted
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before allowing a trial call
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
        }
    }
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a duration
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Warming scheduler and predictor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    /// Run the warming scheduler at all
    pub enabled: bool,
    /// Seconds between scheduler ticks
    pub interval_secs: u64,
    /// Maximum rule executions running at once
    pub max_concurrent_warms: usize,
    /// Capacity of the set-triggered warming queue
    pub trigger_queue_capacity: usize,
    /// TTL of "last warmed" markers, in seconds
    pub marker_ttl_secs: u64,
    /// Seconds between access-pattern analysis passes
    pub analysis_interval_secs: u64,
    /// Minimum tracked users before the predictor trains
    pub min_training_users: usize,
    /// Number of clusters fitted by the predictor
    pub clusters: usize,
    /// Access timestamps retained per user
    pub history_len: usize,
    /// Days of access history kept during analysis
    pub retention_days: i64,
    /// Upper bound on users warmed per predictive pass
    pub max_predicted_users: usize,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_concurrent_warms: 8,
            trigger_queue_capacity: 1024,
            marker_ttl_secs: 24 * 3600,
            analysis_interval_secs: 3600,
            min_training_users: 10,
            clusters: 3,
            history_len: 100,
            retention_days: 30,
            max_predicted_users: 100,
        }
    }
}

impl WarmingConfig {
    /// Tick interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Marker TTL
    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }

    /// Analysis interval
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }
}

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Distributed tier
    pub distributed: DistributedConfig,
    /// Memory tier
    pub memory: MemoryConfig,
    /// Default TTL in seconds for entries set without one
    pub default_ttl_secs: u64,
    /// Value compression
    pub compression: CompressionConfig,
    /// Circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Warming
    pub warming: WarmingConfig,
    /// Run the metrics collection loop and exporter
    pub metrics_enabled: bool,
    /// Seconds between health/metrics collection passes
    pub metrics_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            distributed: DistributedConfig::default(),
            memory: MemoryConfig::default(),
            default_ttl_secs: 3600,
            compression: CompressionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            warming: WarmingConfig::default(),
            metrics_enabled: true,
            metrics_interval_secs: 30,
        }
    }
}

impl CacheConfig {
    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Metrics collection interval
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Reject settings the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory.capacity == 0 {
            return Err(Error::Config("memory.capacity must be > 0".into()));
        }
        if self.default_ttl_secs == 0 {
            return Err(Error::Config("default_ttl_secs must be > 0".into()));
        }
        if self.memory.sweep_interval_secs == 0 {
            return Err(Error::Config("memory.sweep_interval_secs must be > 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.distributed.request_timeout_ms == 0 {
            return Err(Error::Config(
                "distributed.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.distributed.write_behind_concurrency == 0 {
            return Err(Error::Config(
                "distributed.write_behind_concurrency must be > 0".into(),
            ));
        }
        if self.warming.interval_secs == 0 || self.warming.analysis_interval_secs == 0 {
            return Err(Error::Config("warming intervals must be > 0".into()));
        }
        if self.warming.max_concurrent_warms == 0 || self.warming.trigger_queue_capacity == 0 {
            return Err(Error::Config(
                "warming concurrency and queue capacity must be > 0".into(),
            ));
        }
        if self.warming.clusters == 0 {
            return Err(Error::Config("warming.clusters must be > 0".into()));
        }
        if self.warming.history_len == 0 {
            return Err(Error::Config("warming.history_len must be > 0".into()));
        }
        if self.metrics_interval_secs == 0 {
            return Err(Error::Config("metrics_interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_ttl(), Duration::from_secs(3600));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.distributed.endpoints.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = CacheConfig::default();
        config.memory.capacity = 0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_zero_clusters_rejected() {
        let mut config = CacheConfig::default();
        config.warming.clusters = 0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let yaml = r#"
distributed:
  endpoints: ["redis://10.0.0.1:6379", "redis://10.0.0.2:6379"]
  request_timeout_ms: 200
memory:
  capacity: 3
default_ttl_secs: 60
warming:
  enabled: false
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.distributed.endpoints.len(), 2);
        assert_eq!(config.distributed.request_timeout(), Duration::from_millis(200));
        assert_eq!(config.memory.capacity, 3);
        assert_eq!(config.default_ttl_secs, 60);
        assert!(!config.warming.enabled);
        // Untouched sections keep their defaults
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
        assert_eq!(config.warming.interval_secs, 60);
    }

    #[test]
    fn test_yaml_invalid_values_rejected() {
        let yaml = "memory:\n  capacity: 0\n";
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_yaml_malformed() {
        assert_matches!(
            CacheConfig::from_yaml_str("memory: [1, 2"),
            Err(Error::Yaml(_))
        );
    }
}
