//! Memory Tier - In-Process Hot Cache
//!
//! Bounded key -> item map with approximate-LRU eviction and TTL expiry.
//!
//! # Design
//!
//! - Single coarse lock around the map; held only for the map mutation, never
//!   across I/O
//! - Capacity counted in entries. When an insert of a new key finds the tier
//!   full, the oldest 10% (at least one) ranked by last-access-or-creation are
//!   evicted in one O(n log n) pass
//! - Expiry is checked lazily on every read and also by a periodic sweep

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheItem, TierTag};
use super::metrics::CacheMetrics;
use super::pattern::glob_match;

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, CacheItem>,
    /// Sum of `size_bytes` over resident items
    bytes: u64,
    /// Logical clock for recency ties
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<CacheItem> {
        let removed = self.map.remove(key)?;
        self.bytes = self.bytes.saturating_sub(removed.size_bytes());
        Some(removed)
    }
}

/// Memory tier
pub struct MemoryTier {
    inner: Mutex<Inner>,
    capacity: usize,
    metrics: Arc<CacheMetrics>,
}

impl MemoryTier {
    /// Create a memory tier holding at most `capacity` entries
    pub fn new(capacity: usize, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Get a value, bumping its access metadata. Expired entries are removed
    /// and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.map.get(key) {
            Some(item) => item.is_expired_at(now),
            None => return None,
        };

        if expired {
            inner.remove(key);
            self.metrics.record_expirations(1);
            self.publish_stats(&inner);
            return None;
        }

        let tick = inner.tick();
        let item = inner.map.get_mut(key)?;
        item.record_access(now, tick);
        Some(item.value().clone())
    }

    /// Copy of the stored item without touching access metadata
    pub fn peek(&self, key: &str) -> Option<CacheItem> {
        let inner = self.inner.lock();
        inner
            .map
            .get(key)
            .filter(|item| !item.is_expired())
            .cloned()
    }

    /// Insert or replace a value. Returns the number of entries evicted to
    /// make room.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration, tier: TierTag) -> usize {
        let mut item = CacheItem::new(value, ttl, tier);
        let mut inner = self.inner.lock();

        let mut evicted = 0;
        if !inner.map.contains_key(key) && inner.map.len() >= self.capacity {
            evicted = self.evict_oldest(&mut inner);
        }

        let tick = inner.tick();
        item.stamp(tick);
        inner.bytes += item.size_bytes();
        if let Some(old) = inner.map.insert(key.to_string(), item) {
            inner.bytes = inner.bytes.saturating_sub(old.size_bytes());
        }

        self.publish_stats(&inner);
        evicted
    }

    /// Remove a key
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.remove(key).is_some();
        if removed {
            self.publish_stats(&inner);
        }
        removed
    }

    /// Whether a live (unexpired) entry exists
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .map
            .get(key)
            .map(|item| !item.is_expired())
            .unwrap_or(false)
    }

    /// Remove every resident key matching the glob; full scan. Expired
    /// entries are dropped too but not counted.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let doomed: Vec<(String, bool)> = inner
            .map
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, item)| (key.clone(), !item.is_expired_at(now)))
            .collect();

        for (key, _) in &doomed {
            inner.remove(key);
        }
        if !doomed.is_empty() {
            self.publish_stats(&inner);
        }
        doomed.iter().filter(|(_, live)| *live).count()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, item)| item.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }

        if !expired.is_empty() {
            self.metrics.record_expirations(expired.len() as u64);
            self.publish_stats(&inner);
            debug!(removed = expired.len(), "Memory tier expiry sweep");
        }
        expired.len()
    }

    /// Evict the oldest 10% (rounded up, at least one) by last access or
    /// creation time. Caller holds the lock.
    fn evict_oldest(&self, inner: &mut Inner) -> usize {
        let count = inner.map.len().div_ceil(10);
        if count == 0 {
            return 0;
        }

        let mut ranked: Vec<((Instant, u64), String)> = inner
            .map
            .iter()
            .map(|(key, item)| (item.eviction_rank(), key.clone()))
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in ranked.iter().take(count) {
            inner.remove(key);
        }

        self.metrics.record_evictions(count as u64);
        debug!(evicted = count, "Memory tier at capacity, evicted oldest entries");
        count
    }

    fn publish_stats(&self, inner: &Inner) {
        self.metrics
            .update_memory_stats(inner.map.len() as u64, inner.bytes);
    }

    /// Resident keys (including expired-but-unswept)
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().map.keys().cloned().collect()
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes accounted to resident entries
    pub fn memory_usage(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Entry capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.bytes = 0;
        self.publish_stats(&inner);
    }
}

// =============================================================================
// Tests
// =============================================================================
