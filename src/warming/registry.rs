//! Warming Rule Registry
//!
//! Holds rules keyed by pattern and decides, per tick, whether a rule may be
//! dispatched. "Last warmed" markers live in the cache itself under
//! `warming:last:{pattern}` so every process sharing the distributed tier
//! sees them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::rule::{WarmingCondition, WarmingRule};
use super::source::DataSource;
use crate::cache::{glob_match, TieredCache, WriteStrategy};
use crate::error::{Error, Result};

/// Prefix of "last warmed" marker keys
pub const MARKER_PREFIX: &str = "warming:last:";

/// Marker key for a rule pattern
pub fn marker_key(pattern: &str) -> String {
    format!("{MARKER_PREFIX}{pattern}")
}

/// Outcome of the eligibility gates for one rule
#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    Eligible,
    /// Warmed less than one frequency window ago
    TooSoon { last_warmed: DateTime<Utc> },
    /// A declared condition does not hold
    ConditionUnmet(WarmingCondition),
    /// A dependency pattern has never been warmed
    DependencyUnmet(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Registered warming rules
pub struct WarmingRuleRegistry {
    rules: RwLock<BTreeMap<String, Arc<WarmingRule>>>,
    cache: Arc<TieredCache>,
    marker_ttl: Duration,
}

impl WarmingRuleRegistry {
    pub fn new(cache: Arc<TieredCache>, marker_ttl: Duration) -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            cache,
            marker_ttl,
        }
    }

    /// Register a rule. Patterns are unique.
    pub fn register(&self, rule: WarmingRule) -> Result<()> {
        let mut rules = self.rules.write();
        if rules.contains_key(&rule.pattern) {
            return Err(Error::Config(format!(
                "warming rule '{}' already registered",
                rule.pattern
            )));
        }
        for dependency in &rule.dependencies {
            if dependency == &rule.pattern {
                return Err(Error::Config(format!(
                    "warming rule '{}' depends on itself",
                    rule.pattern
                )));
            }
        }
        debug!(pattern = %rule.pattern, priority = %rule.priority, "Registered warming rule");
        rules.insert(rule.pattern.clone(), Arc::new(rule));
        Ok(())
    }

    pub fn get(&self, pattern: &str) -> Option<Arc<WarmingRule>> {
        self.rules.read().get(pattern).cloned()
    }

    /// All rules, Critical first, then by pattern
    pub fn rules(&self) -> Vec<Arc<WarmingRule>> {
        let mut rules: Vec<_> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.pattern.cmp(&b.pattern)));
        rules
    }

    /// Rules whose pattern matches a key, in priority order
    pub fn matching(&self, key: &str) -> Vec<Arc<WarmingRule>> {
        self.rules()
            .into_iter()
            .filter(|rule| glob_match(&rule.pattern, key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When a pattern last finished warming successfully
    pub async fn last_warmed(&self, pattern: &str) -> Option<DateTime<Utc>> {
        self.cache.get_untracked(&marker_key(pattern)).await
    }

    /// Persist a successful warm
    pub async fn mark_warmed(&self, pattern: &str, at: DateTime<Utc>) {
        let stored = self
            .cache
            .set(&marker_key(pattern), &at, Some(self.marker_ttl), WriteStrategy::CacheAside)
            .await;
        if !stored {
            // Still readable locally; other processes will not see it
            debug!(pattern, "Warming marker not persisted to distributed tier");
        }
    }

    /// Run the frequency, condition and dependency gates for a rule
    pub async fn eligibility(
        &self,
        rule: &WarmingRule,
        source: &dyn DataSource,
        now: DateTime<Utc>,
    ) -> Eligibility {
        if let Some(last_warmed) = self.last_warmed(&rule.pattern).await {
            // A marker ahead of `now` counts as just warmed
            let too_soon = match now.signed_duration_since(last_warmed).to_std() {
                Ok(elapsed) => elapsed < rule.frequency,
                Err(_) => true,
            };
            if too_soon {
                return Eligibility::TooSoon { last_warmed };
            }
        }

        for condition in &rule.conditions {
            match condition.evaluate(source, now).await {
                Ok(true) => {}
                Ok(false) => return Eligibility::ConditionUnmet(condition.clone()),
                Err(e) => {
                    warn!(
                        pattern = %rule.pattern,
                        condition = %condition,
                        error = %e,
                        "Warming condition could not be evaluated"
                    );
                    return Eligibility::ConditionUnmet(condition.clone());
                }
            }
        }

        for dependency in &rule.dependencies {
            if self.last_warmed(dependency).await.is_none() {
                return Eligibility::DependencyUnmet(dependency.clone());
            }
        }

        Eligibility::Eligible
    }
}
