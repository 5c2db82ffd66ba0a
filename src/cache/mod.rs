//! Tiered Cache
//!
//! In-process memory tier in front of a distributed tier (Redis or Redis
//! Cluster), with a circuit breaker isolating the remote dependency.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TieredCache                          │
//! │      get / set(strategy) / delete / invalidate_pattern      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  MemoryTier                  │  DistributedTier             │
//! │  bounded map, approx-LRU     │  CircuitBreaker + timeout    │
//! │  lazy + swept TTL expiry     │  ValueCodec (JSON + LZ4)     │
//! │                              │  DistributedBackend          │
//! │                              │   ├─ RedisBackend            │
//! │                              │   └─ InMemoryBackend         │
//! └──────────────────────────────┴──────────────────────────────┘
//!                 │ CacheMetrics (shared by all)
//! ```
//!
//! # Features
//!
//! - **Write strategies**: cache-aside, write-through, write-behind
//! - **Failure isolation**: remote errors and timeouts feed the breaker and
//!   degrade to a miss, never to an error at the call site
//! - **Compression**: LZ4 above a size threshold, only when it shrinks
//! - **Events**: broadcast of set/delete/invalidate for subscribers

pub mod circuit;
pub mod codec;
pub mod distributed;
pub mod entry;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod pattern;
pub mod remote;
pub mod strategy;
pub mod tiered;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use codec::{FrameKind, ValueCodec};
pub use distributed::{BackendStats, DistributedBackend, DistributedTier, InMemoryBackend};
pub use entry::{CacheItem, TierTag};
pub use events::{CacheEvent, EventBus};
pub use memory::MemoryTier;
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use pattern::{glob_match, is_glob};
pub use remote::RedisBackend;
pub use strategy::WriteStrategy;
pub use tiered::TieredCache;
