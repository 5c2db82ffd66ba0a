//! Prometheus Exporter
//!
//! Mirrors an [`ObservabilitySnapshot`] into a private Prometheus registry and
//! renders it in the text exposition format for `/metrics`.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::cache::CircuitState;
use crate::error::{Error, Result};
use crate::service::ObservabilitySnapshot;

const PREFIX: &str = "tierwarm";

fn int_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(format!("{PREFIX}_{name}"), help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(format!("{PREFIX}_{name}"), help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::new(format!("{PREFIX}_{name}"), help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Advance a counter to a monotonic source value
fn sync(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

fn circuit_code(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

/// Cache, breaker and warming metrics
pub struct MetricsExporter {
    registry: Registry,

    hits: IntCounter,
    misses: IntCounter,
    memory_hits: IntCounter,
    distributed_hits: IntCounter,
    sets: IntCounter,
    deletes: IntCounter,
    evictions: IntCounter,
    expirations: IntCounter,
    errors: IntCounter,
    write_behind_failed: IntCounter,
    warm_triggers_dropped: IntCounter,
    memory_entries: IntGauge,
    memory_bytes: IntGauge,
    hit_rate: Gauge,
    average_latency_seconds: Gauge,

    distributed_up: IntGauge,
    circuit_state: IntGauge,
    circuit_failures: IntGauge,
    circuit_trips: IntCounter,

    warming_runs: IntCounter,
    warming_failures: IntCounter,
    warming_items: IntCounter,
    warming_active: IntGauge,
    warming_rules: IntGauge,
    warming_average_seconds: Gauge,
    tracked_patterns: IntGauge,
    predicted_users_warmed: IntCounter,
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let r = Registry::new();
        Ok(Self {
            hits: int_counter(&r, "cache_hits_total", "Lookups served by either tier")?,
            misses: int_counter(&r, "cache_misses_total", "Lookups served by neither tier")?,
            memory_hits: int_counter(&r, "cache_memory_hits_total", "Lookups served by the memory tier")?,
            distributed_hits: int_counter(
                &r,
                "cache_distributed_hits_total",
                "Lookups served by the distributed tier",
            )?,
            sets: int_counter(&r, "cache_sets_total", "Set operations")?,
            deletes: int_counter(&r, "cache_deletes_total", "Delete operations")?,
            evictions: int_counter(&r, "cache_evictions_total", "Memory tier evictions")?,
            expirations: int_counter(&r, "cache_expirations_total", "Memory tier expirations")?,
            errors: int_counter(&r, "cache_errors_total", "Tier and codec errors absorbed")?,
            write_behind_failed: int_counter(
                &r,
                "cache_write_behind_failed_total",
                "Deferred distributed writes that failed",
            )?,
            warm_triggers_dropped: int_counter(
                &r,
                "cache_warm_triggers_dropped_total",
                "Warm triggers dropped on a full queue",
            )?,
            memory_entries: int_gauge(&r, "cache_memory_entries", "Resident memory tier entries")?,
            memory_bytes: int_gauge(&r, "cache_memory_bytes", "Memory tier payload bytes")?,
            hit_rate: gauge(&r, "cache_hit_rate", "Hits over lookups")?,
            average_latency_seconds: gauge(
                &r,
                "cache_average_latency_seconds",
                "Mean operation latency over the recent window",
            )?,
            distributed_up: int_gauge(&r, "distributed_up", "1 when a distributed tier is configured")?,
            circuit_state: int_gauge(
                &r,
                "circuit_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            )?,
            circuit_failures: int_gauge(&r, "circuit_failures", "Consecutive distributed failures")?,
            circuit_trips: int_counter(&r, "circuit_trips_total", "Times the breaker opened")?,
            warming_runs: int_counter(&r, "warming_runs_total", "Warming rule executions")?,
            warming_failures: int_counter(&r, "warming_failures_total", "Failed warming rule executions")?,
            warming_items: int_counter(&r, "warming_items_total", "Items written by warming")?,
            warming_active: int_gauge(&r, "warming_active_tasks", "Warming rules running now")?,
            warming_rules: int_gauge(&r, "warming_rules", "Registered warming rules")?,
            warming_average_seconds: gauge(
                &r,
                "warming_average_duration_seconds",
                "Mean warming rule duration",
            )?,
            tracked_patterns: int_gauge(&r, "warming_tracked_patterns", "Users with access history")?,
            predicted_users_warmed: int_counter(
                &r,
                "warming_predicted_users_total",
                "Users warmed by prediction",
            )?,
            registry: r,
        })
    }

    /// Copy a snapshot into the registry
    pub fn update(&self, snapshot: &ObservabilitySnapshot) {
        let cache = &snapshot.cache;
        sync(&self.hits, cache.hits);
        sync(&self.misses, cache.misses);
        sync(&self.memory_hits, cache.memory_hits);
        sync(&self.distributed_hits, cache.distributed_hits);
        sync(&self.sets, cache.sets);
        sync(&self.deletes, cache.deletes);
        sync(&self.evictions, cache.evictions);
        sync(&self.expirations, cache.expirations);
        sync(&self.errors, cache.errors);
        sync(&self.write_behind_failed, cache.write_behind_failed);
        sync(&self.warm_triggers_dropped, cache.warm_triggers_dropped);
        self.memory_entries.set(cache.memory_entries as i64);
        self.memory_bytes.set(cache.memory_bytes as i64);
        self.hit_rate.set(cache.hit_rate);
        self.average_latency_seconds
            .set(cache.average_latency_us as f64 / 1_000_000.0);

        self.distributed_up.set(i64::from(!snapshot.memory_only));
        if let Some(circuit) = &snapshot.circuit {
            self.circuit_state.set(circuit_code(circuit.state));
            self.circuit_failures.set(i64::from(circuit.failure_count));
            sync(&self.circuit_trips, circuit.trips);
        }

        if let Some(warming) = &snapshot.warming {
            sync(&self.warming_runs, warming.runs);
            sync(&self.warming_failures, warming.failures);
            sync(&self.warming_items, warming.total_items_warmed);
            sync(&self.predicted_users_warmed, warming.predicted_users_warmed);
            self.warming_active.set(warming.active_tasks as i64);
            self.warming_rules.set(warming.registered_rules as i64);
            self.tracked_patterns.set(warming.tracked_patterns as i64);
            self.warming_average_seconds
                .set(warming.average_warming_duration_ms / 1000.0);
        }
    }

    /// Text exposition of the current registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("non-UTF-8 metrics: {e}")))
    }

    /// Content type of [`render`](Self::render)
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
