//! Cache Warming
//!
//! Proactively repopulates the cache ahead of demand.
//!
//! # Architecture
//!
//! ```text
//!            tick (interval)          set(key) ─▶ bounded trigger queue
//!                  │                                   │
//!                  ▼                                   ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      WarmingScheduler                         │
//! │  frequency gate ─▶ condition gate ─▶ dependency gate          │
//! │  in-flight set + permits ─▶ one task per rule                 │
//! ├───────────────────────────────┬───────────────────────────────┤
//! │  WarmingRuleRegistry          │  AccessPatternTracker         │
//! │  rules + last-warmed markers  │    ─▶ WarmingPredictor        │
//! │  (stored in the cache)        │    ─▶ per-user warm           │
//! └───────────────────────────────┴───────────────────────────────┘
//!                  │ DataSource (read-only)
//! ```

pub mod patterns;
pub mod predictor;
pub mod registry;
pub mod rule;
pub mod scheduler;
pub mod source;
pub mod standard;

pub use patterns::{AccessPattern, AccessPatternTracker};
pub use predictor::{PredictorModel, WarmingPredictor};
pub use registry::{marker_key, Eligibility, WarmingRuleRegistry, MARKER_PREFIX};
pub use rule::{WarmingCondition, WarmingContext, WarmingFunction, WarmingPriority, WarmingRule};
pub use scheduler::{AnalysisOutcome, WarmingScheduler, WarmingStats};
pub use source::{DataSource, RecordSummary, StaticDataSource, UserActivity, UserSnapshot};
pub use standard::{register_standard_rules, warm_user};
