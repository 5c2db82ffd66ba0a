//! Distributed Tier
//!
//! Client abstraction over a clustered remote cache. Every call is bounded by
//! the request timeout and guarded by the circuit breaker; a timeout counts as
//! a failure exactly like a remote error.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
use super::metrics::CacheMetrics;
use super::pattern::{glob_match, is_glob};
use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// Remote cache backend
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Backend name for logs and status
    fn name(&self) -> &'static str;

    /// Fetch a framed value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a framed value with a TTL
    async fn setex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove a key, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Iterate keys matching a glob and delete them, returning the count
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Operation counters
    fn stats(&self) -> BackendStats;
}

/// Backend operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub scans: u64,
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Process-local backend with fault injection, for tests and memory-backed
/// development runs
pub struct InMemoryBackend {
    storage: DashMap<String, (Bytes, Instant)>,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            failing: AtomicBool::new(false),
            latency: Mutex::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Whether an unexpired value is stored
    pub fn contains(&self, key: &str) -> bool {
        self.storage
            .get(key)
            .map(|entry| entry.1 > Instant::now())
            .unwrap_or(false)
    }

    /// Raw stored frame, bypassing fault injection
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.storage.get(key).map(|entry| entry.0.clone())
    }

    /// Stored key count
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    async fn simulate(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Backend("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let now = Instant::now();
        let expired = match self.storage.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.storage.remove(key);
        }
        Ok(None)
    }

    async fn setex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;
        self.storage
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;
        Ok(self.storage.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;

        let keys: Vec<String> = self
            .storage
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.storage.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.simulate().await
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Guarded Tier
// =============================================================================

/// Distributed tier: backend + circuit breaker + request timeout
pub struct DistributedTier {
    backend: Arc<dyn DistributedBackend>,
    breaker: CircuitBreaker,
    timeout: Duration,
    metrics: Arc<CacheMetrics>,
}

impl DistributedTier {
    /// Wrap a backend
    pub fn new(
        backend: Arc<dyn DistributedBackend>,
        breaker_config: &CircuitBreakerConfig,
        timeout: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(breaker_config),
            timeout,
            metrics,
        }
    }

    /// Run one remote call under the breaker and timeout
    async fn guarded<T, F>(&self, operation: &'static str, key: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.breaker.can_execute() {
            return Err(Error::CircuitOpen);
        }

        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation,
                timeout: self.timeout,
            }),
        };

        match outcome {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_transient() {
                    self.breaker.record_failure();
                } else {
                    // The tier answered, it just refused this call
                    self.breaker.record_success();
                }
                self.metrics.record_error();
                warn!(
                    backend = self.backend.name(),
                    operation,
                    key,
                    error = %e,
                    "Distributed tier call failed"
                );
                Err(e)
            }
        }
    }

    /// Fetch a framed value
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.guarded("get", key, self.backend.get(key)).await
    }

    /// Store a framed value
    pub async fn set(&self, key: &str, frame: Bytes, ttl: Duration) -> Result<()> {
        self.guarded("setex", key, self.backend.setex(key, frame, ttl))
            .await
    }

    /// Remove a key
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.guarded("delete", key, self.backend.delete(key)).await
    }

    /// Remove every key matching a glob. A pattern without metacharacters
    /// is a plain delete and skips the scan.
    pub async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        if !is_glob(pattern) {
            let removed = self.guarded("delete", pattern, self.backend.delete(pattern)).await?;
            return Ok(u64::from(removed));
        }
        self.guarded("scan", pattern, self.backend.delete_matching(pattern))
            .await
    }

    /// Liveness check, also feeding the breaker
    pub async fn ping(&self) -> Result<()> {
        self.guarded("ping", "", self.backend.ping()).await
    }

    /// Whether the breaker currently admits calls
    pub fn is_available(&self) -> bool {
        self.breaker.state() != CircuitState::Open
    }

    /// Breaker status
    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Backend name
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Backend operation counters
    pub fn backend_stats(&self) -> BackendStats {
        self.backend.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TTL: Duration = Duration::from_secs(60);

    fn tier(backend: Arc<InMemoryBackend>) -> (DistributedTier, Arc<CacheMetrics>) {
        let metrics = Arc::new(CacheMetrics::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_secs: 10,
        };
        let tier = DistributedTier::new(
            backend,
            &config,
            Duration::from_millis(100),
            metrics.clone(),
        );
        (tier, metrics)
    }

    #[tokio::test]
    async fn test_in_memory_backend_roundtrip() {
        let backend = InMemoryBackend::new();
        backend
            .setex("k", Bytes::from_static(b"frame"), TTL)
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().unwrap().as_ref(), b"frame");
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert_eq!(
            backend.stats(),
            BackendStats {
                reads: 1,
                writes: 1,
                deletes: 2,
                scans: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_backend_ttl() {
        let backend = InMemoryBackend::new();
        backend
            .setex("k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let backend = InMemoryBackend::new();
        for key in ["user:1", "user:2", "record:1"] {
            backend.setex(key, Bytes::from_static(b"v"), TTL).await.unwrap();
        }
        assert_eq!(backend.delete_matching("user:*").await.unwrap(), 2);
        assert_eq!(backend.delete_matching("user:*").await.unwrap(), 0);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_open_breaker() {
        let backend = Arc::new(InMemoryBackend::new());
        let (tier, metrics) = tier(backend.clone());
        backend.set_failing(true);

        assert_matches!(tier.get("k").await, Err(Error::Backend(_)));
        assert_matches!(tier.get("k").await, Err(Error::Backend(_)));
        assert_eq!(tier.circuit().state, CircuitState::Open);
        assert!(!tier.is_available());
        assert_eq!(metrics.errors(), 2);

        // Open breaker short-circuits without touching the backend
        let reads_before = backend.stats().reads;
        assert_matches!(tier.get("k").await, Err(Error::CircuitOpen));
        assert_eq!(backend.stats().reads, reads_before);
        assert_eq!(metrics.errors(), 2);
    }

    /// Reachable backend that rejects every call
    struct RejectingBackend;

    #[async_trait]
    impl DistributedBackend for RejectingBackend {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Err(Error::InvalidFrame("rejected".into()))
        }

        async fn setex(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
            Err(Error::InvalidFrame("rejected".into()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn delete_matching(&self, _pattern: &str) -> Result<u64> {
            Ok(0)
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        fn stats(&self) -> BackendStats {
            BackendStats::default()
        }
    }

    #[tokio::test]
    async fn test_rejected_calls_do_not_trip_breaker() {
        let metrics = Arc::new(CacheMetrics::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_secs: 10,
        };
        let tier = DistributedTier::new(
            Arc::new(RejectingBackend),
            &config,
            Duration::from_millis(100),
            metrics.clone(),
        );

        for _ in 0..5 {
            assert_matches!(tier.get("k").await, Err(Error::InvalidFrame(_)));
        }
        assert_eq!(tier.circuit().state, CircuitState::Closed);
        assert_eq!(tier.circuit().failure_count, 0);
        assert_eq!(metrics.errors(), 5);
    }

    #[tokio::test]
    async fn test_literal_pattern_skips_scan() {
        let backend = Arc::new(InMemoryBackend::new());
        let (tier, _) = tier(backend.clone());
        for key in ["users:active", "users:active2"] {
            tier.set(key, Bytes::from_static(b"v"), TTL).await.unwrap();
        }

        assert_eq!(tier.delete_matching("users:active").await.unwrap(), 1);
        assert_eq!(tier.delete_matching("users:active").await.unwrap(), 0);
        assert!(backend.contains("users:active2"));
        assert_eq!(backend.stats().scans, 0);

        assert_eq!(tier.delete_matching("users:*").await.unwrap(), 1);
        assert_eq!(backend.stats().scans, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let backend = Arc::new(InMemoryBackend::new());
        let (tier, metrics) = tier(backend.clone());
        backend.set_latency(Some(Duration::from_secs(1)));

        assert_matches!(
            tier.set("k", Bytes::from_static(b"v"), TTL).await,
            Err(Error::Timeout { operation: "setex", .. })
        );
        assert_eq!(tier.circuit().failure_count, 1);
        assert_eq!(metrics.errors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_after_timeout() {
        let backend = Arc::new(InMemoryBackend::new());
        let (tier, _) = tier(backend.clone());
        backend.set_failing(true);
        let _ = tier.ping().await;
        let _ = tier.ping().await;
        assert!(!tier.is_available());

        backend.set_failing(false);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tier.ping().await.is_ok());
        assert_eq!(tier.circuit().state, CircuitState::Closed);
    }
}
