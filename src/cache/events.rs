//! Cache Events
//!
//! Mutations are published on a broadcast channel so cross-cutting hooks
//! (invalidation fan-out, audit) can follow the cache without being called
//! inline. Slow subscribers lag and lose events; publishers never block.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::strategy::WriteStrategy;

/// Default broadcast buffer
pub const EVENT_BUFFER: usize = 1024;

/// A completed cache mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A value was written successfully
    Set {
        key: String,
        strategy: WriteStrategy,
        timestamp: DateTime<Utc>,
    },

    /// A key was removed from both tiers
    Delete {
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A glob invalidation ran
    Invalidate {
        pattern: String,
        removed: u64,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub fn set(key: &str, strategy: WriteStrategy) -> Self {
        CacheEvent::Set {
            key: key.to_string(),
            strategy,
            timestamp: Utc::now(),
        }
    }

    pub fn delete(key: &str) -> Self {
        CacheEvent::Delete {
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn invalidate(pattern: &str, removed: u64) -> Self {
        CacheEvent::Invalidate {
            pattern: pattern.to_string(),
            removed,
            timestamp: Utc::now(),
        }
    }

    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Set { .. } => "set",
            CacheEvent::Delete { .. } => "delete",
            CacheEvent::Invalidate { .. } => "invalidate",
        }
    }

    /// Key or pattern the event concerns
    pub fn subject(&self) -> &str {
        match self {
            CacheEvent::Set { key, .. } | CacheEvent::Delete { key, .. } => key,
            CacheEvent::Invalidate { pattern, .. } => pattern,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::Set { timestamp, .. }
            | CacheEvent::Delete { timestamp, .. }
            | CacheEvent::Invalidate { timestamp, .. } => *timestamp,
        }
    }
}

/// Broadcast publisher for cache events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; a bus with none drops the event
    pub fn publish(&self, event: CacheEvent) {
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}
