//! Warming Rules
//!
//! A rule names a key pattern, how urgent it is, how often it may run, the
//! conditions that must hold, the patterns that must have been warmed before
//! it, and the function that actually repopulates the cache.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::source::DataSource;
use crate::cache::TieredCache;
use crate::error::Result;

/// Dispatch priority. Rules are evaluated Critical first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarmingPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for WarmingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WarmingPriority::Critical => "critical",
            WarmingPriority::High => "high",
            WarmingPriority::Medium => "medium",
            WarmingPriority::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Condition gating a rule. All of a rule's conditions must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WarmingCondition {
    /// UTC hour within `[start_hour, end_hour)`; wraps past midnight when
    /// `start_hour > end_hour`
    BusinessHours { start_hour: u32, end_hour: u32 },
    /// At least `min` users active in the last hour
    ActiveUsers { min: u64 },
    /// At least `min` distinct popular search terms
    PopularSearches { min: u64 },
    /// At least `min` records not yet embedded
    NewRecords { min: u64 },
}

impl WarmingCondition {
    /// 09:00-17:00 UTC
    pub fn business_hours() -> Self {
        WarmingCondition::BusinessHours {
            start_hour: 9,
            end_hour: 17,
        }
    }

    /// Evaluate against the data source at `now`
    pub async fn evaluate(&self, source: &dyn DataSource, now: DateTime<Utc>) -> Result<bool> {
        let holds = match *self {
            WarmingCondition::BusinessHours {
                start_hour,
                end_hour,
            } => within_hours(now.hour(), start_hour, end_hour),
            WarmingCondition::ActiveUsers { min } => {
                let since = now - chrono::Duration::hours(1);
                source.active_user_count(since).await? >= min
            }
            WarmingCondition::PopularSearches { min } => {
                source.popular_search_count().await? >= min
            }
            WarmingCondition::NewRecords { min } => {
                source.unembedded_record_count().await? >= min
            }
        };
        Ok(holds)
    }
}

impl fmt::Display for WarmingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarmingCondition::BusinessHours {
                start_hour,
                end_hour,
            } => write!(f, "business_hours({start_hour:02}-{end_hour:02} UTC)"),
            WarmingCondition::ActiveUsers { min } => write!(f, "active_users>={min}"),
            WarmingCondition::PopularSearches { min } => write!(f, "popular_searches>={min}"),
            WarmingCondition::NewRecords { min } => write!(f, "new_records>={min}"),
        }
    }
}

fn within_hours(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// What a refresh function gets to work with
#[derive(Clone)]
pub struct WarmingContext {
    pub cache: Arc<TieredCache>,
    pub source: Arc<dyn DataSource>,
    /// Key whose `set` triggered this run, if any
    pub trigger_key: Option<String>,
    /// Scheduler time of the dispatch
    pub now: DateTime<Utc>,
}

/// Repopulates the cache for one rule, returning the number of items warmed
#[async_trait]
pub trait WarmingFunction: Send + Sync {
    async fn warm(&self, ctx: WarmingContext) -> Result<usize>;
}

#[async_trait]
impl<F, Fut> WarmingFunction for F
where
    F: Fn(WarmingContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    async fn warm(&self, ctx: WarmingContext) -> Result<usize> {
        (self)(ctx).await
    }
}

/// A registered warming rule
#[derive(Clone)]
pub struct WarmingRule {
    pub pattern: String,
    pub priority: WarmingPriority,
    pub frequency: Duration,
    pub conditions: Vec<WarmingCondition>,
    pub dependencies: Vec<String>,
    pub refresh: Arc<dyn WarmingFunction>,
}

impl WarmingRule {
    pub fn new(
        pattern: impl Into<String>,
        priority: WarmingPriority,
        frequency: Duration,
        refresh: impl WarmingFunction + 'static,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            priority,
            frequency,
            conditions: Vec::new(),
            dependencies: Vec::new(),
            refresh: Arc::new(refresh),
        }
    }

    /// Add a gating condition
    pub fn with_condition(mut self, condition: WarmingCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Require `pattern` to have been warmed at least once before this rule
    pub fn depends_on(mut self, pattern: impl Into<String>) -> Self {
        self.dependencies.push(pattern.into());
        self
    }
}

impl fmt::Debug for WarmingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmingRule")
            .field("pattern", &self.pattern)
            .field("priority", &self.priority)
            .field("frequency", &self.frequency)
            .field("conditions", &self.conditions)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warming::source::StaticDataSource;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, 30, 0).unwrap()
    }

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![
            WarmingPriority::Low,
            WarmingPriority::Critical,
            WarmingPriority::Medium,
            WarmingPriority::High,
        ];
        priorities.sort();
        assert_eq!(priorities[0], WarmingPriority::Critical);
        assert_eq!(priorities[3], WarmingPriority::Low);
    }

    #[test]
    fn test_hour_windows() {
        assert!(within_hours(9, 9, 17));
        assert!(within_hours(16, 9, 17));
        assert!(!within_hours(17, 9, 17));
        assert!(!within_hours(3, 9, 17));
        // Overnight window
        assert!(within_hours(23, 22, 6));
        assert!(within_hours(2, 22, 6));
        assert!(!within_hours(12, 22, 6));
    }

    #[tokio::test]
    async fn test_business_hours_condition() {
        let source = StaticDataSource::new();
        let condition = WarmingCondition::business_hours();
        assert!(condition.evaluate(&source, at_hour(10)).await.unwrap());
        assert!(!condition.evaluate(&source, at_hour(20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_conditions() {
        let source = StaticDataSource::new();
        source.set_popular_searches(4);
        source.set_unembedded_records(0);

        let now = at_hour(12);
        assert!(WarmingCondition::PopularSearches { min: 3 }
            .evaluate(&source, now)
            .await
            .unwrap());
        assert!(!WarmingCondition::NewRecords { min: 1 }
            .evaluate(&source, now)
            .await
            .unwrap());
        assert!(!WarmingCondition::ActiveUsers { min: 1 }
            .evaluate(&source, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_condition_propagates_source_error() {
        let source = StaticDataSource::new();
        source.set_failing(true);
        assert!(WarmingCondition::NewRecords { min: 1 }
            .evaluate(&source, at_hour(12))
            .await
            .is_err());
    }

    async fn noop(_ctx: WarmingContext) -> Result<usize> {
        Ok(0)
    }

    #[test]
    fn test_builder_and_display() {
        let rule = WarmingRule::new(
            "user:*:profile",
            WarmingPriority::Medium,
            Duration::from_secs(3600),
            noop,
        )
        .with_condition(WarmingCondition::ActiveUsers { min: 5 })
        .depends_on("users:active");

        assert_eq!(rule.dependencies, vec!["users:active".to_string()]);
        assert_eq!(rule.conditions[0].to_string(), "active_users>=5");
        assert!(format!("{rule:?}").contains("user:*:profile"));
    }
}
