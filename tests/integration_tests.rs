//! tierwarm Integration Tests
//!
//! End-to-end behaviour through the public API:
//! - Tiered cache: round-trip, expiry, eviction, invalidation
//! - Circuit breaker transitions and failure isolation
//! - Write strategy semantics with a failing distributed tier
//! - Warming scheduler: non-overlap, dependency gating, prediction
//! - Service lifecycle and observability

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tierwarm::cache::{DistributedBackend, InMemoryBackend, TieredCache, WriteStrategy};
use tierwarm::config::CacheConfig;

fn distributed_cache(config: &CacheConfig) -> (TieredCache, Arc<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new());
    let cache = TieredCache::new(config, Some(backend.clone() as Arc<dyn DistributedBackend>));
    (cache, backend)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Listing {
    id: u32,
    title: String,
    tags: Vec<String>,
}

fn listing(id: u32) -> Listing {
    Listing {
        id,
        title: format!("Listing {id}"),
        tags: vec!["remote".into(), "rust".into()],
    }
}

// =============================================================================
// Tiered Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use tierwarm::cache::CacheEvent;

    #[tokio::test]
    async fn test_round_trip_every_strategy() {
        let (cache, _backend) = distributed_cache(&CacheConfig::default());

        for (i, strategy) in [
            WriteStrategy::CacheAside,
            WriteStrategy::WriteThrough,
            WriteStrategy::WriteBehind,
        ]
        .into_iter()
        .enumerate()
        {
            let key = format!("listing:{i}");
            assert!(cache.set(&key, &listing(i as u32), Some(Duration::from_secs(60)), strategy).await);
            assert_eq!(cache.get::<Listing>(&key).await, Some(listing(i as u32)));
        }
        cache.flush_write_behind().await;
    }

    #[tokio::test]
    async fn test_distributed_hit_populates_memory() {
        let config = CacheConfig::default();
        let backend = Arc::new(InMemoryBackend::new());
        let writer = TieredCache::new(&config, Some(backend.clone() as Arc<dyn DistributedBackend>));
        let reader = TieredCache::new(&config, Some(backend.clone() as Arc<dyn DistributedBackend>));

        writer.set("shared", &listing(7), None, WriteStrategy::CacheAside).await;
        assert_eq!(reader.memory_len(), 0);

        assert_eq!(reader.get::<Listing>("shared").await, Some(listing(7)));
        assert_eq!(reader.memory_len(), 1);
        let metrics = reader.metrics();
        assert_eq!(metrics.distributed_hits, 1);

        assert_eq!(reader.get::<Listing>("shared").await, Some(listing(7)));
        assert_eq!(reader.metrics().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_large_values_round_trip_compressed() {
        let mut config = CacheConfig::default();
        config.compression.threshold_bytes = 64;
        let (cache, backend) = distributed_cache(&config);

        let big: Vec<String> = (0..200).map(|_| "repeated text ".to_string()).collect();
        cache.set("big", &big, None, WriteStrategy::WriteThrough).await;

        let raw = backend.raw("big").unwrap();
        assert!(raw.len() < serde_json::to_vec(&big).unwrap().len());

        cache.clear_local();
        assert_eq!(cache.get::<Vec<String>>("big").await, Some(big));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let (cache, _backend) = distributed_cache(&CacheConfig::default());
        cache.set("session", &"abc", Some(Duration::from_secs(60)), WriteStrategy::CacheAside).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get::<String>("session").await.as_deref(), Some("abc"));

        tokio::time::advance(Duration::from_secs(2)).await;
        // Expired in memory; the distributed copy expired too
        assert_eq!(cache.get::<String>("session").await, None);
    }

    #[tokio::test]
    async fn test_eviction_scenario() {
        let mut config = CacheConfig::default();
        config.memory.capacity = 3;
        let cache = TieredCache::memory_only(&config);

        for key in ["a", "b", "c", "d"] {
            cache.set(key, &key, Some(Duration::from_secs(60)), WriteStrategy::CacheAside).await;
        }

        assert_eq!(cache.memory_len(), 3);
        assert_eq!(cache.get::<String>("a").await, None);
        for key in ["b", "c", "d"] {
            assert_eq!(cache.get::<String>(key).await.as_deref(), Some(key));
        }
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[tokio::test]
    async fn test_eviction_bound_under_load() {
        let mut config = CacheConfig::default();
        config.memory.capacity = 50;
        let cache = TieredCache::memory_only(&config);

        for i in 0..500 {
            cache.set(&format!("k{i}"), &i, None, WriteStrategy::CacheAside).await;
            assert!(cache.memory_len() <= 50);
        }
    }

    #[tokio::test]
    async fn test_invalidation_is_idempotent() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        for key in ["user:1:profile", "user:2:profile", "record:1"] {
            cache.set(key, &1, None, WriteStrategy::CacheAside).await;
        }

        let first = cache.invalidate_pattern("user:*").await;
        assert!(first >= 2);
        assert_eq!(cache.invalidate_pattern("user:*").await, 0);

        assert!(cache.exists("record:1").await);
        assert!(!backend.contains("user:1:profile"));
    }

    #[tokio::test]
    async fn test_delete_both_tiers() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        cache.set("k", &1, None, WriteStrategy::CacheAside).await;

        assert!(cache.delete("k").await);
        assert!(!backend.contains("k"));
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_events_published() {
        let cache = TieredCache::memory_only(&CacheConfig::default());
        let mut events = cache.subscribe();

        cache.set("k", &1, None, WriteStrategy::WriteThrough).await;
        cache.delete("k").await;
        cache.invalidate_pattern("k*").await;

        let types: Vec<&str> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .iter()
        .map(CacheEvent::event_type)
        .collect();
        assert_eq!(types, vec!["set", "delete", "invalidate"]);
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

mod circuit_tests {
    use super::*;
    use tierwarm::cache::{CircuitBreaker, CircuitState};

    #[tokio::test(start_paused = true)]
    async fn test_breaker_transitions() {
        let breaker = CircuitBreaker::with_params(3, Duration::from_secs(30));

        for _ in 0..3 {
            assert!(breaker.can_execute());
            breaker.record_failure();
        }
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert!(breaker.can_execute());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_backend_and_recovers() {
        let mut config = CacheConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.recovery_timeout_secs = 10;
        let (cache, backend) = distributed_cache(&config);

        backend.set_failing(true);
        cache.set("a", &1, None, WriteStrategy::CacheAside).await;
        cache.set("b", &2, None, WriteStrategy::CacheAside).await;
        assert_eq!(cache.circuit().unwrap().state, CircuitState::Open);

        // Reads still served locally while open
        assert_eq!(cache.get::<i32>("a").await, Some(1));
        let writes_before = backend.stats().writes;
        assert!(!cache.set("c", &3, None, WriteStrategy::CacheAside).await);
        assert_eq!(backend.stats().writes, writes_before);

        backend.set_failing(false);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.set("d", &4, None, WriteStrategy::CacheAside).await);
        assert_eq!(cache.circuit().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let mut config = CacheConfig::default();
        config.distributed.request_timeout_ms = 50;
        let (cache, backend) = distributed_cache(&config);
        backend.set_latency(Some(Duration::from_secs(1)));

        assert!(!cache.set("slow", &1, None, WriteStrategy::CacheAside).await);
        assert_eq!(cache.get::<i32>("slow").await, Some(1));
        assert_eq!(cache.circuit().unwrap().failure_count, 1);
        assert!(cache.metrics().errors >= 1);
    }
}

// =============================================================================
// Write Strategies
// =============================================================================

mod strategy_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_through_falls_back_to_memory() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        backend.set_failing(true);

        assert!(!cache.set("k", &listing(1), None, WriteStrategy::WriteThrough).await);
        assert_eq!(cache.get::<Listing>("k").await, Some(listing(1)));
    }

    #[tokio::test]
    async fn test_failed_write_notifies_nobody() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        let (tx, mut triggers) = tokio::sync::mpsc::channel(8);
        cache.attach_warming_trigger(tx);
        let mut events = cache.subscribe();
        backend.set_failing(true);

        assert!(!cache.set("k", &listing(3), None, WriteStrategy::WriteThrough).await);
        assert!(triggers.try_recv().is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_behind_never_reports_failure() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        backend.set_failing(true);

        assert!(cache.set("k", &listing(2), None, WriteStrategy::WriteBehind).await);
        assert_eq!(cache.get::<Listing>("k").await, Some(listing(2)));

        cache.flush_write_behind().await;
        assert_eq!(cache.pending_write_behind(), 0);
        assert_eq!(cache.metrics().write_behind_failed, 1);
    }

    #[tokio::test]
    async fn test_write_behind_reaches_backend() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        for i in 0..20 {
            cache.set(&format!("wb:{i}"), &i, None, WriteStrategy::WriteBehind).await;
        }
        cache.flush_write_behind().await;
        assert_eq!(backend.len(), 20);
    }

    #[tokio::test]
    async fn test_cache_aside_reports_distributed_failure() {
        let (cache, backend) = distributed_cache(&CacheConfig::default());
        backend.set_failing(true);

        assert!(!cache.set("k", &1, None, WriteStrategy::CacheAside).await);
        assert_eq!(cache.get::<i32>("k").await, Some(1));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("write-behind".parse::<WriteStrategy>().unwrap(), WriteStrategy::WriteBehind);
        assert_eq!("CACHE_ASIDE".parse::<WriteStrategy>().unwrap(), WriteStrategy::CacheAside);
        assert!("write-around".parse::<WriteStrategy>().is_err());
    }
}

// =============================================================================
// Warming
// =============================================================================

mod warming_tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tierwarm::config::WarmingConfig;
    use tierwarm::error::Result;
    use tierwarm::warming::{
        StaticDataSource, UserActivity, WarmingContext, WarmingPriority, WarmingRule,
        WarmingRuleRegistry, WarmingScheduler,
    };

    static PROFILE_CALLS: AtomicUsize = AtomicUsize::new(0);
    static FEED_CALLS: AtomicUsize = AtomicUsize::new(0);

    async fn warm_profiles(_ctx: WarmingContext) -> Result<usize> {
        PROFILE_CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn warm_feed(ctx: WarmingContext) -> Result<usize> {
        FEED_CALLS.fetch_add(1, Ordering::SeqCst);
        ctx.cache
            .set("feed:latest", &vec![1, 2, 3], None, WriteStrategy::CacheAside)
            .await;
        Ok(3)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn scheduler(source: Arc<StaticDataSource>, config: &WarmingConfig) -> WarmingScheduler {
        let cache = Arc::new(TieredCache::memory_only(&CacheConfig::default()));
        let registry = Arc::new(WarmingRuleRegistry::new(cache.clone(), config.marker_ttl()));
        WarmingScheduler::new(registry, cache, source, config)
    }

    #[tokio::test]
    async fn test_two_ticks_within_frequency_run_once() {
        let scheduler = scheduler(Arc::new(StaticDataSource::new()), &WarmingConfig::default());
        scheduler
            .registry()
            .register(WarmingRule::new(
                "feed:*",
                WarmingPriority::High,
                Duration::from_secs(600),
                warm_feed,
            ))
            .unwrap();

        let before = FEED_CALLS.load(Ordering::SeqCst);
        scheduler.tick_at(noon()).await;
        scheduler.tick_at(noon() + chrono::Duration::minutes(1)).await;
        scheduler.drain().await;
        scheduler.tick_at(noon() + chrono::Duration::minutes(9)).await;
        scheduler.drain().await;

        assert_eq!(FEED_CALLS.load(Ordering::SeqCst) - before, 1);
        assert_eq!(scheduler.stats().total_items_warmed, 3);
    }

    #[tokio::test]
    async fn test_dependency_gating_across_ticks() {
        let scheduler = scheduler(Arc::new(StaticDataSource::new()), &WarmingConfig::default());
        scheduler
            .registry()
            .register(
                WarmingRule::new(
                    "profiles",
                    WarmingPriority::Medium,
                    Duration::from_secs(60),
                    warm_profiles,
                )
                .depends_on("never-warmed"),
            )
            .unwrap();

        let before = PROFILE_CALLS.load(Ordering::SeqCst);
        for minute in 0..5 {
            let dispatched = scheduler
                .tick_at(noon() + chrono::Duration::minutes(minute * 2))
                .await;
            assert!(dispatched.is_empty());
            scheduler.drain().await;
        }
        assert_eq!(PROFILE_CALLS.load(Ordering::SeqCst), before);
        assert_eq!(scheduler.stats().runs, 0);
    }

    #[tokio::test]
    async fn test_standard_rules_warm_in_dependency_order() {
        let source = Arc::new(StaticDataSource::new());
        source.set_users(vec![UserActivity {
            user_id: "u1".into(),
            last_active: noon() - chrono::Duration::minutes(3),
            preferences: vec!["berlin".into()],
        }]);
        let scheduler = scheduler(source, &WarmingConfig::default());
        tierwarm::warming::register_standard_rules(scheduler.registry()).unwrap();

        // First tick: only users:active may run, the profile rule waits on it
        let first = scheduler.tick_at(noon()).await;
        assert_eq!(first, vec!["users:active".to_string()]);
        scheduler.drain().await;

        let second = scheduler.tick_at(noon() + chrono::Duration::minutes(1)).await;
        assert_eq!(second, vec!["user:*:profile".to_string()]);
        scheduler.drain().await;

        let marked = scheduler.registry().last_warmed("user:*:profile").await;
        assert!(marked.is_some());
    }

    #[tokio::test]
    async fn test_predictive_pass_is_bounded() {
        let source = Arc::new(StaticDataSource::new());
        source.set_users(
            (0..25)
                .map(|i| UserActivity {
                    user_id: format!("u{i:02}"),
                    last_active: noon() - chrono::Duration::minutes(i),
                    preferences: vec!["remote".into(); (i % 4) as usize],
                })
                .collect(),
        );
        let config = WarmingConfig {
            max_predicted_users: 4,
            ..WarmingConfig::default()
        };
        let scheduler = scheduler(source, &config);

        let outcome = scheduler.analyze_and_warm(noon()).await;
        assert!(outcome.trained);
        assert!(outcome.predicted <= 4);
        assert_eq!(outcome.warmed, outcome.predicted);
    }
}

// =============================================================================
// Service
// =============================================================================

mod service_tests {
    use super::*;
    use tierwarm::exporter::MetricsExporter;
    use tierwarm::health::HealthStatus;
    use tierwarm::warming::StaticDataSource;
    use tierwarm::CacheService;

    #[tokio::test]
    async fn test_service_with_distributed_tier() {
        let config = CacheConfig::default();
        let (cache, _backend) = distributed_cache(&config);
        let service = CacheService::new(config, Arc::new(cache), Arc::new(StaticDataSource::new())).unwrap();
        service.start().unwrap();

        service.cache().set("k", &1, None, WriteStrategy::WriteBehind).await;
        assert_eq!(service.health_report().status, HealthStatus::Healthy);

        let snapshot = service.observability();
        assert!(!snapshot.memory_only);
        assert_eq!(snapshot.backend, Some("memory"));
        assert!(snapshot.cache.sets >= 1);

        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&snapshot);
        assert!(exporter.render().unwrap().contains("tierwarm_distributed_up 1"));

        service.shutdown().await;
        assert_eq!(service.cache().pending_write_behind(), 0);
    }

    #[tokio::test]
    async fn test_connect_without_endpoints_is_memory_only() {
        let service = CacheService::connect(CacheConfig::default(), Arc::new(StaticDataSource::new()))
            .await
            .unwrap();
        assert!(service.cache().is_memory_only());
        assert_eq!(service.health_report().checks.len(), 4);
    }

    #[tokio::test]
    async fn test_yaml_config() {
        let yaml = r#"
memory:
  capacity: 2
warming:
  enabled: false
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        let service = CacheService::connect(config, Arc::new(StaticDataSource::new()))
            .await
            .unwrap();
        assert!(service.scheduler().is_none());
        assert_eq!(service.cache().memory().capacity(), 2);
    }
}
