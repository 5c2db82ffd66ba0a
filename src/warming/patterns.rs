//! Access Pattern Tracking
//!
//! Per-user access history: bounded timestamp window, accessed keys, derived
//! peak hours and preferences. Feeds the predictor.

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::source::DataSource;
use crate::error::Result;

/// Number of peak hours derived per user
pub const PEAK_HOURS: usize = 3;

/// How far back a tracking pass looks for active users
const ACTIVITY_LOOKBACK_HOURS: i64 = 1;

/// One user's access history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPattern {
    pub user_id: String,
    /// Oldest first, at most `history_len`
    pub accesses: VecDeque<DateTime<Utc>>,
    pub accessed_keys: BTreeSet<String>,
    /// Most frequent hours of day, most frequent first
    pub peak_hours: Vec<u32>,
    pub preferences: Vec<String>,
}

impl AccessPattern {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            accesses: VecDeque::new(),
            accessed_keys: BTreeSet::new(),
            peak_hours: Vec::new(),
            preferences: Vec::new(),
        }
    }

    fn recompute_peak_hours(&mut self) {
        let mut counts = [0usize; 24];
        for at in &self.accesses {
            counts[at.hour() as usize] += 1;
        }

        let mut hours: Vec<u32> = (0..24u32).filter(|h| counts[*h as usize] > 0).collect();
        // Most frequent first, earlier hour wins ties
        hours.sort_by(|a, b| counts[*b as usize].cmp(&counts[*a as usize]).then(a.cmp(b)));
        hours.truncate(PEAK_HOURS);
        self.peak_hours = hours;
    }

    /// Most recent access
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.accesses.back().copied()
    }
}

/// Tracker over all users
pub struct AccessPatternTracker {
    patterns: RwLock<HashMap<String, AccessPattern>>,
    history_len: usize,
    retention: Duration,
}

impl AccessPatternTracker {
    pub fn new(history_len: usize, retention_days: i64) -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            history_len: history_len.max(1),
            retention: Duration::days(retention_days.max(1)),
        }
    }

    /// Append an access. Timestamps are kept in arrival order; the oldest is
    /// dropped past `history_len`.
    pub fn record_access(&self, user_id: &str, at: DateTime<Utc>, key: Option<&str>) {
        let mut patterns = self.patterns.write();
        let pattern = patterns
            .entry(user_id.to_string())
            .or_insert_with(|| AccessPattern::new(user_id));

        // The same activity timestamp seen on consecutive passes is one access
        if pattern.accesses.back() != Some(&at) {
            pattern.accesses.push_back(at);
            while pattern.accesses.len() > self.history_len {
                pattern.accesses.pop_front();
            }
            pattern.recompute_peak_hours();
        }

        if let Some(key) = key {
            pattern.accessed_keys.insert(key.to_string());
        }
    }

    /// Replace a user's preference list
    pub fn set_preferences(&self, user_id: &str, preferences: Vec<String>) {
        let mut patterns = self.patterns.write();
        patterns
            .entry(user_id.to_string())
            .or_insert_with(|| AccessPattern::new(user_id))
            .preferences = preferences;
    }

    /// Pull recently active users from the source and record their activity.
    /// Returns the number of users seen.
    pub async fn refresh_from_source(
        &self,
        source: &dyn DataSource,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let since = now - Duration::hours(ACTIVITY_LOOKBACK_HOURS);
        let users = source.recently_active_users(since).await?;

        for user in &users {
            let profile_key = format!("user:{}:profile", user.user_id);
            self.record_access(&user.user_id, user.last_active, Some(&profile_key));
            if !user.preferences.is_empty() {
                self.set_preferences(&user.user_id, user.preferences.clone());
            }
        }

        debug!(users = users.len(), "Access patterns refreshed");
        Ok(users.len())
    }

    /// Drop timestamps older than the retention window, and users left with
    /// no history. Returns the number of users dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut patterns = self.patterns.write();
        for pattern in patterns.values_mut() {
            let before = pattern.accesses.len();
            while pattern.accesses.front().is_some_and(|at| *at < cutoff) {
                pattern.accesses.pop_front();
            }
            if pattern.accesses.len() != before {
                pattern.recompute_peak_hours();
            }
        }

        let before = patterns.len();
        patterns.retain(|_, pattern| !pattern.accesses.is_empty());
        before - patterns.len()
    }

    pub fn get(&self, user_id: &str) -> Option<AccessPattern> {
        self.patterns.read().get(user_id).cloned()
    }

    /// All patterns ordered by user id
    pub fn snapshot(&self) -> Vec<AccessPattern> {
        let mut patterns: Vec<_> = self.patterns.read().values().cloned().collect();
        patterns.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
