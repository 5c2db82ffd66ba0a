//! Tiered Cache - Memory + Distributed
//!
//! Reads consult the memory tier first, then the distributed tier (if its
//! breaker admits the call), populating memory on a remote hit. Writes follow
//! the selected [`WriteStrategy`].
//!
//! Distributed-tier failures never reach callers: they are recorded in the
//! circuit breaker and metrics and surface as a miss or a `false` return.
//!
//! # Example
//!
//! ```
//! use tierwarm::cache::{TieredCache, WriteStrategy};
//! use tierwarm::config::CacheConfig;
//!
//! # tokio_test::block_on(async {
//! let cache = TieredCache::memory_only(&CacheConfig::default());
//! assert!(cache.set("greeting", &"hello", None, WriteStrategy::CacheAside).await);
//! let value: Option<String> = cache.get("greeting").await;
//! assert_eq!(value.as_deref(), Some("hello"));
//! # });
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tracing::{debug, info, warn};

use super::circuit::CircuitSnapshot;
use super::codec::ValueCodec;
use super::distributed::{DistributedBackend, DistributedTier};
use super::entry::TierTag;
use super::events::{CacheEvent, EventBus};
use super::memory::MemoryTier;
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::remote::RedisBackend;
use super::strategy::WriteStrategy;
use crate::config::CacheConfig;
use crate::error::Error;

/// Background writes still waiting on the distributed tier
#[derive(Default)]
struct WriteBehindState {
    pending: AtomicUsize,
    drained: Notify,
}

/// Two-tier cache
pub struct TieredCache {
    memory: MemoryTier,
    distributed: Option<Arc<DistributedTier>>,
    codec: ValueCodec,
    default_ttl: Duration,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
    write_behind_permits: Arc<Semaphore>,
    write_behind: Arc<WriteBehindState>,
    /// Set-triggered warming queue, attached once by the scheduler
    warm_trigger: OnceCell<mpsc::Sender<String>>,
}

impl TieredCache {
    /// Build a cache over an optional distributed backend
    pub fn new(config: &CacheConfig, backend: Option<Arc<dyn DistributedBackend>>) -> Self {
        let metrics = Arc::new(CacheMetrics::new());
        let distributed = backend.map(|backend| {
            Arc::new(DistributedTier::new(
                backend,
                &config.circuit_breaker,
                config.distributed.request_timeout(),
                metrics.clone(),
            ))
        });

        Self {
            memory: MemoryTier::new(config.memory.capacity, metrics.clone()),
            distributed,
            codec: ValueCodec::new(&config.compression),
            default_ttl: config.default_ttl(),
            metrics,
            events: EventBus::default(),
            write_behind_permits: Arc::new(Semaphore::new(
                config.distributed.write_behind_concurrency.max(1),
            )),
            write_behind: Arc::new(WriteBehindState::default()),
            warm_trigger: OnceCell::new(),
        }
    }

    /// Memory tier only
    pub fn memory_only(config: &CacheConfig) -> Self {
        Self::new(config, None)
    }

    /// Connect to the configured endpoints, degrading to memory-only mode
    /// when there are none or the connection fails
    pub async fn connect(config: &CacheConfig) -> Self {
        if config.distributed.endpoints.is_empty() {
            info!("No distributed endpoints configured, running memory-only");
            return Self::memory_only(config);
        }

        match RedisBackend::connect(&config.distributed).await {
            Ok(backend) => Self::new(config, Some(Arc::new(backend))),
            Err(e) => {
                warn!(
                    error = %e,
                    endpoints = ?config.distributed.endpoints,
                    "Distributed tier unavailable, continuing in memory-only mode"
                );
                Self::memory_only(config)
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Typed lookup. A value that fails to deserialize is treated as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_raw(key).await?;
        match ValueCodec::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.metrics.record_error();
                warn!(key, error = %e, "Cached value failed to deserialize");
                None
            }
        }
    }

    /// Typed lookup with a fallback
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).await.unwrap_or(default)
    }

    /// Lookup returning the serialized bytes
    pub async fn get_raw(&self, key: &str) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        let result = self.lookup(key).await;
        if result.is_none() {
            self.metrics.record_miss();
        }
        self.metrics.record_latency(tracker.elapsed());
        result
    }

    async fn lookup(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.memory.get(key) {
            self.metrics.record_memory_hit();
            return Some(value);
        }

        let distributed = self.distributed.as_ref()?;
        let frame = match distributed.get(key).await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => return None,
        };

        match self.codec.decode(&frame) {
            Ok(serialized) => {
                self.memory.set(
                    key,
                    serialized.clone(),
                    self.default_ttl,
                    TierTag::Distributed,
                );
                self.metrics.record_distributed_hit();
                Some(serialized)
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(key, error = %e, "Distributed value failed to decode");
                None
            }
        }
    }

    /// Typed lookup for internal bookkeeping keys. Leaves the hit/miss
    /// counters and latency window alone and does not populate memory.
    pub(crate) async fn get_untracked<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let serialized = match self.memory.peek(key) {
            Some(item) => item.value().clone(),
            None => {
                let distributed = self.distributed.as_ref()?;
                let frame = distributed.get(key).await.ok()??;
                self.codec.decode(&frame).ok()?
            }
        };
        ValueCodec::deserialize(&serialized).ok()
    }

    /// Whether either tier holds the key. Does not populate memory.
    pub async fn exists(&self, key: &str) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        match &self.distributed {
            Some(distributed) => matches!(distributed.get(key).await, Ok(Some(_))),
            None => false,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Serialize and store a value. `ttl` of `None` uses the default TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        strategy: WriteStrategy,
    ) -> bool {
        match ValueCodec::serialize(value) {
            Ok(serialized) => self.set_raw(key, serialized, ttl, strategy).await,
            Err(e) => {
                self.metrics.record_error();
                warn!(key, error = %e, "Value failed to serialize, set skipped");
                false
            }
        }
    }

    /// Store already-serialized bytes
    pub async fn set_raw(
        &self,
        key: &str,
        serialized: Bytes,
        ttl: Option<Duration>,
        strategy: WriteStrategy,
    ) -> bool {
        let tracker = LatencyTracker::start();
        let ttl = ttl.unwrap_or(self.default_ttl);

        let success = match strategy {
            WriteStrategy::CacheAside => {
                self.memory.set(key, serialized.clone(), ttl, TierTag::Memory);
                self.write_distributed(key, &serialized, ttl).await
            }
            WriteStrategy::WriteThrough => {
                let stored = self.write_distributed(key, &serialized, ttl).await;
                if !stored {
                    debug!(key, "Write-through fell back to memory only");
                }
                self.memory.set(key, serialized, ttl, TierTag::Memory);
                stored
            }
            WriteStrategy::WriteBehind => {
                self.memory.set(key, serialized.clone(), ttl, TierTag::Memory);
                self.schedule_write_behind(key, serialized, ttl);
                true
            }
        };

        self.metrics.record_set();
        self.metrics.record_latency(tracker.elapsed());
        if success {
            self.events.publish(CacheEvent::set(key, strategy));
            self.trigger_warming(key);
        }
        success
    }

    /// Synchronous distributed write. Memory-only mode counts as success.
    async fn write_distributed(&self, key: &str, serialized: &[u8], ttl: Duration) -> bool {
        let Some(distributed) = &self.distributed else {
            return true;
        };
        let (frame, _) = self.codec.encode(serialized);
        distributed.set(key, frame, ttl).await.is_ok()
    }

    fn schedule_write_behind(&self, key: &str, serialized: Bytes, ttl: Duration) {
        let Some(distributed) = self.distributed.clone() else {
            return;
        };

        let (frame, _) = self.codec.encode(&serialized);
        let key = key.to_string();
        let permits = self.write_behind_permits.clone();
        let state = self.write_behind.clone();
        let metrics = self.metrics.clone();

        state.pending.fetch_add(1, Ordering::SeqCst);
        metrics.record_write_behind_scheduled();

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => distributed.set(&key, frame, ttl).await,
                Err(_) => Err(Error::Internal("write-behind semaphore closed".into())),
            };
            if outcome.is_err() {
                metrics.record_write_behind_failed();
                debug!(key = %key, "Write-behind to distributed tier failed");
            }

            if state.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                state.drained.notify_waiters();
            }
        });
    }

    /// Writes scheduled but not yet finished
    pub fn pending_write_behind(&self) -> usize {
        self.write_behind.pending.load(Ordering::SeqCst)
    }

    /// Wait until every scheduled write-behind has completed
    pub async fn flush_write_behind(&self) {
        loop {
            let drained = self.write_behind.drained.notified();
            if self.write_behind.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove from both tiers. Both are always attempted; returns false only
    /// when the distributed removal failed.
    pub async fn delete(&self, key: &str) -> bool {
        self.memory.delete(key);
        let success = match &self.distributed {
            Some(distributed) => distributed.delete(key).await.is_ok(),
            None => true,
        };

        self.metrics.record_delete();
        self.events.publish(CacheEvent::delete(key));
        success
    }

    /// Remove every key matching a glob from both tiers. The count is the sum
    /// over both tiers, so a key resident in both counts twice.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let local = self.memory.remove_matching(pattern) as u64;
        let remote = match &self.distributed {
            Some(distributed) => distributed.delete_matching(pattern).await.unwrap_or(0),
            None => 0,
        };

        let removed = local + remote;
        debug!(pattern, local, remote, "Pattern invalidation");
        self.events.publish(CacheEvent::invalidate(pattern, removed));
        removed
    }

    /// Drop every memory-tier entry
    pub fn clear_local(&self) {
        self.memory.clear();
    }

    /// Expiry sweep over the memory tier
    pub fn sweep_expired(&self) -> usize {
        self.memory.sweep_expired()
    }

    // =========================================================================
    // Warming & events
    // =========================================================================

    /// Attach the set-triggered warming queue. Only the first call wins.
    pub fn attach_warming_trigger(&self, tx: mpsc::Sender<String>) -> bool {
        self.warm_trigger.set(tx).is_ok()
    }

    fn trigger_warming(&self, key: &str) {
        let Some(tx) = self.warm_trigger.get() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(key.to_string()) {
            self.metrics.record_warm_trigger_dropped();
        }
    }

    /// Subscribe to mutation events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Ping the distributed tier. `None` in memory-only mode.
    pub async fn ping_distributed(&self) -> Option<bool> {
        let distributed = self.distributed.as_ref()?;
        Some(distributed.ping().await.is_ok())
    }

    /// Whether no distributed tier is configured
    pub fn is_memory_only(&self) -> bool {
        self.distributed.is_none()
    }

    /// Circuit breaker status, if a distributed tier exists
    pub fn circuit(&self) -> Option<CircuitSnapshot> {
        self.distributed.as_ref().map(|d| d.circuit())
    }

    /// Distributed backend name
    pub fn backend_name(&self) -> Option<&'static str> {
        self.distributed.as_ref().map(|d| d.backend_name())
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared metrics handle
    pub fn metrics_handle(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Entries resident in the memory tier
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Memory tier
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// Default TTL
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

// =============================================================================
// Tests
// =============================================================================
