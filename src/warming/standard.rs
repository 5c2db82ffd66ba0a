//! Stock Warming Rules
//!
//! Rules every deployment registers, built only on [`DataSource`]:
//!
//! | Pattern          | Priority | Every  | Gates                                   |
//! |------------------|----------|--------|-----------------------------------------|
//! | `users:active`   | Critical | 15 min |                                         |
//! | `record:*`       | High     | 30 min | new records >= 1                        |
//! | `user:*:profile` | Medium   | 60 min | active users >= 1, after `users:active` |

use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::registry::WarmingRuleRegistry;
use super::rule::{WarmingCondition, WarmingContext, WarmingPriority, WarmingRule};
use super::source::DataSource;
use crate::cache::{TieredCache, WriteStrategy};
use crate::error::Result;

pub const ACTIVE_USERS_KEY: &str = "users:active";
pub const RECORD_PATTERN: &str = "record:*";
pub const USER_PROFILE_PATTERN: &str = "user:*:profile";

const ACTIVE_USERS_TTL: Duration = Duration::from_secs(15 * 60);
const RECORD_TTL: Duration = Duration::from_secs(30 * 60);
const USER_TTL: Duration = Duration::from_secs(60 * 60);

/// Records pulled per `record:*` run
const RECENT_RECORDS: usize = 100;

/// Activity window behind `users:active`
const ACTIVE_WINDOW_HOURS: i64 = 1;

/// Users warmed concurrently by `user:*:profile`
const PROFILE_CONCURRENCY: usize = 8;

/// Register the stock rules
pub fn register_standard_rules(registry: &WarmingRuleRegistry) -> Result<()> {
    registry.register(WarmingRule::new(
        ACTIVE_USERS_KEY,
        WarmingPriority::Critical,
        Duration::from_secs(15 * 60),
        warm_active_users,
    ))?;

    registry.register(
        WarmingRule::new(
            RECORD_PATTERN,
            WarmingPriority::High,
            Duration::from_secs(30 * 60),
            warm_recent_records,
        )
        .with_condition(WarmingCondition::NewRecords { min: 1 }),
    )?;

    registry.register(
        WarmingRule::new(
            USER_PROFILE_PATTERN,
            WarmingPriority::Medium,
            Duration::from_secs(60 * 60),
            warm_active_profiles,
        )
        .with_condition(WarmingCondition::ActiveUsers { min: 1 })
        .depends_on(ACTIVE_USERS_KEY),
    )?;

    Ok(())
}

/// Cache key for one record
pub fn record_key(id: &str) -> String {
    format!("record:{id}")
}

/// Cache the ids of users active in the last hour
async fn warm_active_users(ctx: WarmingContext) -> Result<usize> {
    let since = ctx.now - chrono::Duration::hours(ACTIVE_WINDOW_HOURS);
    let users = ctx.source.recently_active_users(since).await?;
    let ids: Vec<&str> = users.iter().map(|u| u.user_id.as_str()).collect();

    ctx.cache
        .set(ACTIVE_USERS_KEY, &ids, Some(ACTIVE_USERS_TTL), WriteStrategy::CacheAside)
        .await;
    debug!(users = ids.len(), "Warmed active user list");
    Ok(1)
}

async fn warm_recent_records(ctx: WarmingContext) -> Result<usize> {
    let records = ctx.source.recent_records(RECENT_RECORDS).await?;
    for record in &records {
        ctx.cache
            .set(&record_key(&record.id), record, Some(RECORD_TTL), WriteStrategy::CacheAside)
            .await;
    }
    Ok(records.len())
}

/// Warm every user on the cached active list. One user failing does not
/// stop the others.
async fn warm_active_profiles(ctx: WarmingContext) -> Result<usize> {
    let users: Vec<String> = match ctx.cache.get(ACTIVE_USERS_KEY).await {
        Some(users) => users,
        None => {
            let since = ctx.now - chrono::Duration::hours(ACTIVE_WINDOW_HOURS);
            ctx.source
                .recently_active_users(since)
                .await?
                .into_iter()
                .map(|u| u.user_id)
                .collect()
        }
    };

    let warmed = stream::iter(users)
        .map(|user_id| {
            let cache = ctx.cache.clone();
            let source = ctx.source.clone();
            async move {
                match warm_user(&cache, source.as_ref(), &user_id).await {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to warm user");
                        0
                    }
                }
            }
        })
        .buffer_unordered(PROFILE_CONCURRENCY)
        .fold(0, |total, items| async move { total + items })
        .await;
    Ok(warmed)
}

/// Warm one user's profile, applications and recommendations. Returns the
/// number of keys written.
pub async fn warm_user(cache: &TieredCache, source: &dyn DataSource, user_id: &str) -> Result<usize> {
    let snapshot = source.user_snapshot(user_id).await?;

    cache
        .set(
            &format!("user:{user_id}:profile"),
            &snapshot.profile,
            Some(USER_TTL),
            WriteStrategy::CacheAside,
        )
        .await;
    cache
        .set(
            &format!("user:{user_id}:applications"),
            &snapshot.applications,
            Some(USER_TTL),
            WriteStrategy::CacheAside,
        )
        .await;
    cache
        .set(
            &format!("user:{user_id}:recommendations"),
            &snapshot.recommendations,
            Some(USER_TTL),
            WriteStrategy::CacheAside,
        )
        .await;

    Ok(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::warming::rule::WarmingFunction;
    use crate::warming::source::{RecordSummary, StaticDataSource, UserActivity};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn fixture() -> (Arc<TieredCache>, Arc<StaticDataSource>) {
        let cache = Arc::new(TieredCache::memory_only(&CacheConfig::default()));
        let source = Arc::new(StaticDataSource::new());
        source.set_users(vec![
            UserActivity {
                user_id: "u1".into(),
                last_active: now() - chrono::Duration::minutes(5),
                preferences: vec!["remote".into()],
            },
            UserActivity {
                user_id: "u2".into(),
                last_active: now() - chrono::Duration::hours(3),
                preferences: vec![],
            },
        ]);
        source.set_records(vec![
            RecordSummary {
                id: "r1".into(),
                title: "Platform engineer".into(),
                body: "Rust".into(),
            },
            RecordSummary {
                id: "r2".into(),
                title: "SRE".into(),
                body: "Redis".into(),
            },
        ]);
        (cache, source)
    }

    fn context(cache: &Arc<TieredCache>, source: &Arc<StaticDataSource>) -> WarmingContext {
        WarmingContext {
            cache: cache.clone(),
            source: source.clone(),
            trigger_key: None,
            now: now(),
        }
    }

    #[test]
    fn test_registers_three_rules() {
        let (cache, _) = fixture();
        let registry = WarmingRuleRegistry::new(cache, Duration::from_secs(3600));
        register_standard_rules(&registry).unwrap();

        assert_eq!(registry.len(), 3);
        let profile = registry.get(USER_PROFILE_PATTERN).unwrap();
        assert_eq!(profile.dependencies, vec![ACTIVE_USERS_KEY.to_string()]);
        assert!(register_standard_rules(&registry).is_err());
    }

    #[tokio::test]
    async fn test_active_users_and_profiles() {
        let (cache, source) = fixture();

        assert_eq!(warm_active_users(context(&cache, &source)).await.unwrap(), 1);
        let active: Vec<String> = cache.get(ACTIVE_USERS_KEY).await.unwrap();
        assert_eq!(active, vec!["u1".to_string()]);

        assert_eq!(warm_active_profiles(context(&cache, &source)).await.unwrap(), 3);
        assert!(cache.exists("user:u1:profile").await);
        assert!(cache.exists("user:u1:recommendations").await);
        assert!(!cache.exists("user:u2:profile").await);
    }

    #[tokio::test]
    async fn test_profiles_continue_past_unknown_users() {
        let (cache, source) = fixture();
        let listed = vec!["ghost".to_string(), "u1".to_string(), "u2".to_string()];
        cache
            .set(ACTIVE_USERS_KEY, &listed, None, WriteStrategy::CacheAside)
            .await;

        let rule = WarmingRule::new(
            USER_PROFILE_PATTERN,
            WarmingPriority::Medium,
            Duration::from_secs(60),
            warm_active_profiles,
        );
        assert_eq!(rule.refresh.warm(context(&cache, &source)).await.unwrap(), 6);
        assert!(cache.exists("user:u1:profile").await);
        assert!(cache.exists("user:u2:applications").await);
        assert!(!cache.exists("user:ghost:profile").await);
    }

    #[tokio::test]
    async fn test_recent_records() {
        let (cache, source) = fixture();
        assert_eq!(warm_recent_records(context(&cache, &source)).await.unwrap(), 2);
        let record: RecordSummary = cache.get("record:r2").await.unwrap();
        assert_eq!(record.title, "SRE");
    }

    #[tokio::test]
    async fn test_warm_user_unknown() {
        let (cache, source) = fixture();
        assert!(warm_user(&cache, source.as_ref(), "ghost").await.is_err());
        assert!(!cache.exists("user:ghost:profile").await);
    }
}
