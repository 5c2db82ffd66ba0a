//! Cache Metrics Collection
//!
//! Monotonic counters plus a bounded latency window for rolling averages.
//! Counters are never reset; they live as long as the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of latency samples kept for the rolling average
pub const LATENCY_WINDOW: usize = 1000;

/// Cache metrics collector
#[derive(Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    errors: AtomicU64,

    // Where hits were served from
    memory_hits: AtomicU64,
    distributed_hits: AtomicU64,

    // Write-behind and trigger accounting
    write_behind_scheduled: AtomicU64,
    write_behind_failed: AtomicU64,
    warm_triggers_dropped: AtomicU64,

    // Memory tier occupancy (gauges)
    memory_entries: AtomicU64,
    memory_bytes: AtomicU64,

    latencies: Mutex<VecDeque<Duration>>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            distributed_hits: AtomicU64::new(0),
            write_behind_scheduled: AtomicU64::new(0),
            write_behind_failed: AtomicU64::new(0),
            warm_triggers_dropped: AtomicU64::new(0),
            memory_entries: AtomicU64::new(0),
            memory_bytes: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_distributed_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.distributed_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_behind_scheduled(&self) {
        self.write_behind_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_behind_failed(&self) {
        self.write_behind_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warm_trigger_dropped(&self) {
        self.warm_triggers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_memory_stats(&self, entries: u64, bytes: u64) {
        self.memory_entries.store(entries, Ordering::Relaxed);
        self.memory_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate over all lookups, 0.0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Append an operation latency, dropping the oldest sample past the window
    pub fn record_latency(&self, duration: Duration) {
        let mut window = self.latencies.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(duration);
    }

    /// Number of latency samples currently held
    pub fn latency_samples(&self) -> usize {
        self.latencies.lock().len()
    }

    /// Mean of the latency window
    pub fn average_latency(&self) -> Duration {
        let window = self.latencies.lock();
        if window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = window.iter().sum();
        total / window.len() as u32
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
            errors: self.errors(),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            distributed_hits: self.distributed_hits.load(Ordering::Relaxed),
            write_behind_scheduled: self.write_behind_scheduled.load(Ordering::Relaxed),
            write_behind_failed: self.write_behind_failed.load(Ordering::Relaxed),
            warm_triggers_dropped: self.warm_triggers_dropped.load(Ordering::Relaxed),
            memory_entries: self.memory_entries.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            average_latency_us: self.average_latency().as_micros() as u64,
            latency_samples: self.latency_samples(),
        }
    }
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    pub memory_hits: u64,
    pub distributed_hits: u64,
    pub write_behind_scheduled: u64,
    pub write_behind_failed: u64,
    pub warm_triggers_dropped: u64,
    pub memory_entries: u64,
    pub memory_bytes: u64,
    pub hit_rate: f64,
    pub average_latency_us: u64,
    pub latency_samples: usize,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
