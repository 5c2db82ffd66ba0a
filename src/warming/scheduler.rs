//! Warming Scheduler
//!
//! Each tick walks the registry in priority order and dispatches every
//! eligible rule as its own task. A rule is never running twice: the
//! in-flight set is claimed before the eligibility gates run and released by
//! a guard when the task ends, however it ends. Dispatch is bounded by `max_concurrent_warms`
//! permits; a rule that finds none free is skipped and retried next tick.
//!
//! Set-triggered warming arrives over a bounded channel fed by
//! [`TieredCache::attach_warming_trigger`] and goes through the same
//! dispatch path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::patterns::AccessPatternTracker;
use super::predictor::WarmingPredictor;
use super::registry::{WarmingRuleRegistry, MARKER_PREFIX};
use super::rule::{WarmingContext, WarmingRule};
use super::source::DataSource;
use super::standard::warm_user;
use crate::cache::TieredCache;
use crate::config::WarmingConfig;
use crate::error::Error;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct WarmingCounters {
    runs: AtomicU64,
    failures: AtomicU64,
    items_warmed: AtomicU64,
    duration_micros: AtomicU64,
    active: AtomicUsize,
    skipped_busy: AtomicU64,
    triggers: AtomicU64,
    predicted_users_warmed: AtomicU64,
    analysis_passes: AtomicU64,
}

impl WarmingCounters {
    fn record_run(&self, items: Option<usize>, elapsed: std::time::Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.duration_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        match items {
            Some(items) => {
                self.items_warmed.fetch_add(items as u64, Ordering::Relaxed);
            }
            None => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Warming statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingStats {
    pub total_items_warmed: u64,
    pub average_warming_duration_ms: f64,
    pub active_tasks: usize,
    pub registered_rules: usize,
    pub tracked_patterns: usize,
    pub runs: u64,
    pub failures: u64,
    /// Eligible rules skipped because every permit was taken
    pub skipped_busy: u64,
    pub triggers_received: u64,
    pub predicted_users_warmed: u64,
    pub analysis_passes: u64,
    pub predictor_trained: bool,
}

/// What one analysis pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisOutcome {
    pub users_seen: usize,
    pub users_pruned: usize,
    pub trained: bool,
    pub predicted: usize,
    pub warmed: usize,
}

// =============================================================================
// In-flight Guard
// =============================================================================

/// A rule's in-flight claim. Dropping it releases the claim, and the active
/// task count once the claim has been handed to a running task.
struct InFlightGuard {
    pattern: String,
    in_flight: Arc<DashSet<String>>,
    counters: Arc<WarmingCounters>,
    running: bool,
}

impl InFlightGuard {
    /// Claim `pattern`, or `None` if it is already claimed
    fn claim(
        pattern: &str,
        in_flight: &Arc<DashSet<String>>,
        counters: &Arc<WarmingCounters>,
    ) -> Option<Self> {
        if !in_flight.insert(pattern.to_string()) {
            return None;
        }
        Some(Self {
            pattern: pattern.to_string(),
            in_flight: in_flight.clone(),
            counters: counters.clone(),
            running: false,
        })
    }

    fn start(&mut self) {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        self.running = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.pattern);
        if self.running {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Rule scheduler plus the predictive warming pipeline
pub struct WarmingScheduler {
    registry: Arc<WarmingRuleRegistry>,
    cache: Arc<TieredCache>,
    source: Arc<dyn DataSource>,
    config: WarmingConfig,
    in_flight: Arc<DashSet<String>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    counters: Arc<WarmingCounters>,
    tracker: AccessPatternTracker,
    predictor: WarmingPredictor,
}

impl WarmingScheduler {
    pub fn new(
        registry: Arc<WarmingRuleRegistry>,
        cache: Arc<TieredCache>,
        source: Arc<dyn DataSource>,
        config: &WarmingConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            source,
            config: config.clone(),
            in_flight: Arc::new(DashSet::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_warms.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            counters: Arc::new(WarmingCounters::default()),
            tracker: AccessPatternTracker::new(config.history_len, config.retention_days),
            predictor: WarmingPredictor::new(
                config.clusters,
                config.min_training_users,
                config.max_predicted_users,
            ),
        }
    }

    pub fn registry(&self) -> &Arc<WarmingRuleRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &AccessPatternTracker {
        &self.tracker
    }

    pub fn predictor(&self) -> &WarmingPredictor {
        &self.predictor
    }

    /// Whether a rule is currently executing
    pub fn is_in_flight(&self, pattern: &str) -> bool {
        self.in_flight.contains(pattern)
    }

    /// Run one tick at the current time
    pub async fn tick(&self) -> Vec<String> {
        self.tick_at(Utc::now()).await
    }

    /// Evaluate every rule at `now`, returning the patterns dispatched
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.reap_finished();

        let mut dispatched = Vec::new();
        for rule in self.registry.rules() {
            if self.dispatch(rule.clone(), now, None).await {
                dispatched.push(rule.pattern.clone());
            }
        }

        if !dispatched.is_empty() {
            debug!(dispatched = ?dispatched, "Warming tick dispatched rules");
        }
        dispatched
    }

    /// Dispatch rules whose pattern matches a freshly set key
    pub async fn handle_trigger(&self, key: &str, now: DateTime<Utc>) -> Vec<String> {
        // Writing a marker must not trigger more warming
        if key.starts_with(MARKER_PREFIX) {
            return Vec::new();
        }
        self.counters.triggers.fetch_add(1, Ordering::Relaxed);
        self.reap_finished();

        let mut dispatched = Vec::new();
        for rule in self.registry.matching(key) {
            if self.dispatch(rule.clone(), now, Some(key.to_string())).await {
                dispatched.push(rule.pattern.clone());
            }
        }
        dispatched
    }

    async fn dispatch(
        &self,
        rule: Arc<WarmingRule>,
        now: DateTime<Utc>,
        trigger_key: Option<String>,
    ) -> bool {
        // Claim before the gates so a concurrent dispatch of the same rule
        // cannot pass them on a stale marker
        let Some(mut guard) = InFlightGuard::claim(&rule.pattern, &self.in_flight, &self.counters)
        else {
            debug!(pattern = %rule.pattern, "Warming rule still in flight");
            return false;
        };

        let eligibility = self
            .registry
            .eligibility(&rule, self.source.as_ref(), now)
            .await;
        if !eligibility.is_eligible() {
            debug!(pattern = %rule.pattern, eligibility = ?eligibility, "Warming rule not eligible");
            return false;
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            self.counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
            debug!(pattern = %rule.pattern, "No warming permit free, retrying next tick");
            return false;
        };
        guard.start();

        let ctx = WarmingContext {
            cache: self.cache.clone(),
            source: self.source.clone(),
            trigger_key,
            now,
        };
        let registry = self.registry.clone();
        let counters = self.counters.clone();

        self.tasks.lock().spawn(async move {
            let _permit = permit;
            let _guard = guard;
            let started = Instant::now();

            match rule.refresh.warm(ctx).await {
                Ok(items) => {
                    // Marker goes in before the claim is released
                    registry.mark_warmed(&rule.pattern, now).await;
                    counters.record_run(Some(items), started.elapsed());
                    info!(
                        pattern = %rule.pattern,
                        priority = %rule.priority,
                        items,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Warming rule completed"
                    );
                }
                Err(e) => {
                    counters.record_run(None, started.elapsed());
                    let e = Error::warming(&rule.pattern, e);
                    warn!(error = %e, "Warming rule failed");
                }
            }
        });
        true
    }

    /// Collect finished warming tasks, logging panics
    fn reap_finished(&self) {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Warming task panicked");
            }
        }
    }

    /// Wait for every dispatched warming task to finish
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Warming task panicked");
            }
        }
    }

    // =========================================================================
    // Predictive Warming
    // =========================================================================

    /// Track recent activity, retrain, and warm the users predicted active.
    /// Source and training failures are logged and skipped; the previous
    /// model stays in use.
    #[instrument(skip(self))]
    pub async fn analyze_and_warm(&self, now: DateTime<Utc>) -> AnalysisOutcome {
        let mut outcome = AnalysisOutcome::default();
        self.counters.analysis_passes.fetch_add(1, Ordering::Relaxed);

        match self.tracker.refresh_from_source(self.source.as_ref(), now).await {
            Ok(seen) => outcome.users_seen = seen,
            Err(e) => warn!(error = %e, "Access pattern refresh failed"),
        }
        outcome.users_pruned = self.tracker.prune(now);

        match self.predictor.train(&self.tracker, now) {
            Ok(_) => outcome.trained = true,
            Err(Error::Training(reason)) => {
                debug!(reason = %reason, "Predictor training skipped")
            }
            Err(e) => warn!(error = %e, "Predictor training failed"),
        }

        let predicted = self.predictor.predict(&self.tracker, now);
        outcome.predicted = predicted.len();

        for user_id in &predicted {
            match warm_user(&self.cache, self.source.as_ref(), user_id).await {
                Ok(_) => outcome.warmed += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "Predictive warm failed"),
            }
        }
        self.counters
            .predicted_users_warmed
            .fetch_add(outcome.warmed as u64, Ordering::Relaxed);

        info!(
            users_seen = outcome.users_seen,
            tracked = self.tracker.len(),
            trained = outcome.trained,
            predicted = outcome.predicted,
            warmed = outcome.warmed,
            "Access pattern analysis complete"
        );
        outcome
    }

    // =========================================================================
    // Background Loops
    // =========================================================================

    /// Tick on the configured interval until cancelled
    pub async fn run_tick_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "Warming scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Warming scheduler stopped");
    }

    /// Consume set-triggered keys until cancelled or the sender is gone
    pub async fn run_trigger_loop(&self, mut triggers: mpsc::Receiver<String>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                key = triggers.recv() => match key {
                    Some(key) => {
                        self.handle_trigger(&key, Utc::now()).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Warming trigger loop stopped");
    }

    /// Run analysis passes on the configured interval until cancelled
    pub async fn run_analysis_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.analysis_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.analyze_and_warm(Utc::now()).await;
                }
            }
        }
        debug!("Access pattern analysis loop stopped");
    }

    pub fn stats(&self) -> WarmingStats {
        let runs = self.counters.runs.load(Ordering::Relaxed);
        let micros = self.counters.duration_micros.load(Ordering::Relaxed);
        let average_warming_duration_ms = if runs == 0 {
            0.0
        } else {
            micros as f64 / runs as f64 / 1000.0
        };

        WarmingStats {
            total_items_warmed: self.counters.items_warmed.load(Ordering::Relaxed),
            average_warming_duration_ms,
            active_tasks: self.counters.active.load(Ordering::SeqCst),
            registered_rules: self.registry.len(),
            tracked_patterns: self.tracker.len(),
            runs,
            failures: self.counters.failures.load(Ordering::Relaxed),
            skipped_busy: self.counters.skipped_busy.load(Ordering::Relaxed),
            triggers_received: self.counters.triggers.load(Ordering::Relaxed),
            predicted_users_warmed: self.counters.predicted_users_warmed.load(Ordering::Relaxed),
            analysis_passes: self.counters.analysis_passes.load(Ordering::Relaxed),
            predictor_trained: self.predictor.is_trained(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
