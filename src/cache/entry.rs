//! Cache Item Types
//!
//! The unit stored by the memory tier.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Smallest TTL an item can carry; keeps `expires_at > created_at`
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// Where a resident item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierTag {
    /// Written locally by a `set`
    Memory,
    /// Populated from a distributed-tier hit
    Distributed,
}

impl std::fmt::Display for TierTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierTag::Memory => write!(f, "memory"),
            TierTag::Distributed => write!(f, "distributed"),
        }
    }
}

/// Memory-tier entry
///
/// `size_bytes` is the serialized footprint recorded at insertion and is the
/// figure both eviction bookkeeping and memory accounting use.
#[derive(Debug, Clone)]
pub struct CacheItem {
    value: Bytes,
    created_at: Instant,
    expires_at: Instant,
    access_count: u64,
    last_accessed: Option<Instant>,
    /// Logical clock value of the last touch, breaks timestamp ties
    recency: u64,
    size_bytes: u64,
    tier: TierTag,
}

impl CacheItem {
    /// Create a new item expiring `ttl` after now
    pub fn new(value: Bytes, ttl: Duration, tier: TierTag) -> Self {
        Self::created_at(value, ttl, tier, Instant::now())
    }

    /// Create an item with an explicit creation instant
    pub fn created_at(value: Bytes, ttl: Duration, tier: TierTag, now: Instant) -> Self {
        let ttl = ttl.max(MIN_TTL);
        Self {
            size_bytes: value.len() as u64,
            value,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            last_accessed: None,
            recency: 0,
            tier,
        }
    }

    /// Stored payload (zero-copy clone)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Creation instant
    #[inline]
    pub fn created(&self) -> Instant {
        self.created_at
    }

    /// Expiry instant
    #[inline]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Number of reads served
    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Last read instant, if ever read
    #[inline]
    pub fn last_accessed(&self) -> Option<Instant> {
        self.last_accessed
    }

    /// Footprint recorded at insertion
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Origin tier
    #[inline]
    pub fn tier(&self) -> TierTag {
        self.tier
    }

    /// Whether the item is past its expiry at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Whether the item is past its expiry
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Remaining lifetime, zero once expired
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Record a read
    pub fn record_access(&mut self, now: Instant, tick: u64) {
        self.access_count += 1;
        self.last_accessed = Some(now);
        self.recency = tick;
    }

    /// Stamp the logical clock at insertion
    pub(crate) fn stamp(&mut self, tick: u64) {
        self.recency = tick;
    }

    /// Ordering key for eviction: last access (or creation), then logical clock
    pub fn eviction_rank(&self) -> (Instant, u64) {
        (self.last_accessed.unwrap_or(self.created_at), self.recency)
    }
}

// =============================================================================
// Tests
// =============================================================================
