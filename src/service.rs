//! Cache Service
//!
//! Owns the tiered cache, the warming scheduler and every background loop.
//! Constructed once by the entry point and handed to consumers; there is no
//! global instance.
//!
//! Background loops (all stop on [`CacheService::shutdown`]):
//!
//! - memory-tier expiry sweep
//! - health/metrics collection (distributed ping + snapshot log)
//! - warming tick
//! - set-triggered warming consumer
//! - access-pattern analysis and predictive warming

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CircuitSnapshot, MetricsSnapshot, TieredCache};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::health::{HealthCheck, HealthResponse};
use crate::warming::{
    register_standard_rules, DataSource, WarmingRule, WarmingRuleRegistry, WarmingScheduler,
    WarmingStats,
};

/// Everything the exporter and `/metrics` need, in one read
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilitySnapshot {
    pub cache: MetricsSnapshot,
    pub circuit: Option<CircuitSnapshot>,
    pub warming: Option<WarmingStats>,
    pub memory_only: bool,
    pub backend: Option<&'static str>,
}

/// Explicitly constructed owner of all cache components
pub struct CacheService {
    config: CacheConfig,
    cache: Arc<TieredCache>,
    scheduler: Option<Arc<WarmingScheduler>>,
    health: Arc<HealthCheck>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    triggers: Mutex<Option<mpsc::Receiver<String>>>,
    started: AtomicBool,
}

impl CacheService {
    /// Assemble the service around an existing cache. Registers the stock
    /// warming rules when warming is enabled.
    pub fn new(config: CacheConfig, cache: Arc<TieredCache>, source: Arc<dyn DataSource>) -> Result<Self> {
        config.validate()?;

        let mut triggers = None;
        let scheduler = if config.warming.enabled {
            let registry = Arc::new(WarmingRuleRegistry::new(
                cache.clone(),
                config.warming.marker_ttl(),
            ));
            register_standard_rules(&registry)?;

            let (tx, rx) = mpsc::channel(config.warming.trigger_queue_capacity);
            if !cache.attach_warming_trigger(tx) {
                return Err(Error::Config(
                    "cache already has a warming trigger attached".into(),
                ));
            }
            triggers = Some(rx);

            Some(Arc::new(WarmingScheduler::new(
                registry,
                cache.clone(),
                source,
                &config.warming,
            )))
        } else {
            info!("Cache warming disabled");
            None
        };

        Ok(Self {
            config,
            cache,
            scheduler,
            health: Arc::new(HealthCheck::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            triggers: Mutex::new(triggers),
            started: AtomicBool::new(false),
        })
    }

    /// Connect the distributed tier from config (memory-only on failure) and
    /// assemble the service
    pub async fn connect(config: CacheConfig, source: Arc<dyn DataSource>) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(TieredCache::connect(&config).await);
        Self::new(config, cache, source)
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> Option<&Arc<WarmingScheduler>> {
        self.scheduler.as_ref()
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register an application warming rule
    pub fn register_rule(&self, rule: WarmingRule) -> Result<()> {
        match &self.scheduler {
            Some(scheduler) => scheduler.registry().register(rule),
            None => Err(Error::Config("cache warming is disabled".into())),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the background loops. Fails if already started.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("cache service already started".into()));
        }

        let mut handles = Vec::new();
        handles.push(self.spawn_sweep_loop());
        if self.config.metrics_enabled {
            handles.push(self.spawn_metrics_loop());
        }

        if let Some(scheduler) = &self.scheduler {
            let token = self.shutdown.clone();
            let tick = scheduler.clone();
            handles.push(tokio::spawn(async move { tick.run_tick_loop(token).await }));

            if let Some(rx) = self.triggers.lock().take() {
                let token = self.shutdown.clone();
                let trigger = scheduler.clone();
                handles.push(tokio::spawn(async move {
                    trigger.run_trigger_loop(rx, token).await
                }));
            }

            let token = self.shutdown.clone();
            let analysis = scheduler.clone();
            handles.push(tokio::spawn(async move {
                analysis.run_analysis_loop(token).await
            }));
        }

        info!(
            loops = handles.len(),
            memory_only = self.cache.is_memory_only(),
            backend = self.cache.backend_name().unwrap_or("none"),
            warming = self.scheduler.is_some(),
            "Cache service started"
        );
        self.handles.lock().extend(handles);
        self.health.set_ready(true);
        Ok(())
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let token = self.shutdown.clone();
        let period = self.config.memory.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Expired entries swept");
                        }
                    }
                }
            }
        })
    }

    fn spawn_metrics_loop(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let token = self.shutdown.clone();
        let period = self.config.metrics_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reachable = true;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(up) = cache.ping_distributed().await {
                            if up != reachable {
                                if up {
                                    info!("Distributed tier reachable again");
                                } else {
                                    warn!("Distributed tier ping failed");
                                }
                                reachable = up;
                            }
                        }
                        let snapshot = cache.metrics();
                        debug!(
                            hits = snapshot.hits,
                            misses = snapshot.misses,
                            hit_rate = snapshot.hit_rate,
                            errors = snapshot.errors,
                            entries = snapshot.memory_entries,
                            "Cache metrics"
                        );
                    }
                }
            }
        })
    }

    /// Stop every loop, then wait for in-flight warms and pending
    /// write-behind writes
    pub async fn shutdown(&self) {
        info!("Cache service shutting down");
        self.health.set_ready(false);
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop ended abnormally");
            }
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.drain().await;
        }
        self.cache.flush_write_behind().await;
        info!("Cache service stopped");
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn observability(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            cache: self.cache.metrics(),
            circuit: self.cache.circuit(),
            warming: self.scheduler.as_ref().map(|s| s.stats()),
            memory_only: self.cache.is_memory_only(),
            backend: self.cache.backend_name(),
        }
    }

    pub fn health_report(&self) -> HealthResponse {
        self.health.report(&self.cache)
    }
}

// =============================================================================
// Tests
// =============================================================================
