//! External Data Source
//!
//! Read-only view of the application's relational store, consumed by warming
//! functions and the access-pattern tracker. The cache never writes to it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A user and their last activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserActivity {
    pub user_id: String,
    pub last_active: DateTime<Utc>,
    /// Saved preferences (locations, titles, skills)
    #[serde(default)]
    pub preferences: Vec<String>,
}

/// A record eligible for warming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// Everything warmed for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user_id: String,
    pub profile: serde_json::Value,
    pub applications: Vec<serde_json::Value>,
    pub recommendations: Vec<String>,
}

/// Read-only queries used by warming
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Users active since `since`, most recent first
    async fn recently_active_users(&self, since: DateTime<Utc>) -> Result<Vec<UserActivity>>;

    /// Number of users active since `since`
    async fn active_user_count(&self, since: DateTime<Utc>) -> Result<u64>;

    /// Distinct popular search terms currently available
    async fn popular_search_count(&self) -> Result<u64>;

    /// Records not yet embedded
    async fn unembedded_record_count(&self) -> Result<u64>;

    /// Most recent records, newest first
    async fn recent_records(&self, limit: usize) -> Result<Vec<RecordSummary>>;

    /// Per-user data to warm
    async fn user_snapshot(&self, user_id: &str) -> Result<UserSnapshot>;
}

// =============================================================================
// Static Source
// =============================================================================

#[derive(Debug, Default)]
struct StaticData {
    users: Vec<UserActivity>,
    records: Vec<RecordSummary>,
    popular_searches: u64,
    unembedded_records: u64,
}

/// Fixed in-process data, for tests and standalone runs
#[derive(Debug, Default)]
pub struct StaticDataSource {
    data: RwLock<StaticData>,
    failing: AtomicBool,
    queries: AtomicU64,
}

impl StaticDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_users(&self, users: Vec<UserActivity>) {
        self.data.write().users = users;
    }

    pub fn set_records(&self, records: Vec<RecordSummary>) {
        self.data.write().records = records;
    }

    pub fn set_popular_searches(&self, count: u64) {
        self.data.write().popular_searches = count;
    }

    pub fn set_unembedded_records(&self, count: u64) {
        self.data.write().unembedded_records = count;
    }

    /// Make every query fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Queries served so far
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn begin(&self) -> Result<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::DataSource("static source set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn recently_active_users(&self, since: DateTime<Utc>) -> Result<Vec<UserActivity>> {
        self.begin()?;
        let mut users: Vec<UserActivity> = self
            .data
            .read()
            .users
            .iter()
            .filter(|u| u.last_active >= since)
            .cloned()
            .collect();
        users.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(users)
    }

    async fn active_user_count(&self, since: DateTime<Utc>) -> Result<u64> {
        self.begin()?;
        let data = self.data.read();
        Ok(data.users.iter().filter(|u| u.last_active >= since).count() as u64)
    }

    async fn popular_search_count(&self) -> Result<u64> {
        self.begin()?;
        Ok(self.data.read().popular_searches)
    }

    async fn unembedded_record_count(&self) -> Result<u64> {
        self.begin()?;
        Ok(self.data.read().unembedded_records)
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<RecordSummary>> {
        self.begin()?;
        Ok(self.data.read().records.iter().take(limit).cloned().collect())
    }

    async fn user_snapshot(&self, user_id: &str) -> Result<UserSnapshot> {
        self.begin()?;
        let data = self.data.read();
        let user = data
            .users
            .iter()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| Error::DataSource(format!("unknown user '{user_id}'")))?;

        Ok(UserSnapshot {
            user_id: user.user_id.clone(),
            profile: serde_json::json!({
                "id": user.user_id,
                "last_active": user.last_active,
                "preferences": user.preferences,
            }),
            applications: Vec::new(),
            recommendations: data.records.iter().take(10).map(|r| r.id.clone()).collect(),
        })
    }
}
