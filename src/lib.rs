//! tierwarm - Tiered Cache with Predictive Warming
//!
//! An in-process memory tier in front of a distributed Redis tier, isolated
//! by a circuit breaker, with a rule-based and prediction-driven warming
//! engine that repopulates the cache ahead of demand.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          CacheService                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ TieredCache  │◀───│   Warming    │───▶│  DataSource  │       │
//! │  │ memory+redis │    │  Scheduler   │    │ (read-only)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │         │ metrics / breaker state                               │
//! │         ▼                                                       │
//! │  health + Prometheus exporter                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Memory tier, distributed tier, breaker, codec, write strategies
//! - [`warming`] - Warming rules, scheduler, access tracking and prediction
//! - [`service`] - Service object owning the components and background loops
//! - [`health`] - Liveness/readiness and tier health
//! - [`exporter`] - Prometheus exposition
//! - [`config`] - Configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;
pub mod exporter;
pub mod health;
pub mod service;
pub mod warming;

// Re-export commonly used types
pub use cache::{TieredCache, WriteStrategy};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use service::{CacheService, ObservabilitySnapshot};
