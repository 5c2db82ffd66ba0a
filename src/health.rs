//! Health Checks
//!
//! Liveness, readiness, and the state of both cache tiers. Losing the
//! distributed tier is `Degraded`, never `Unhealthy`: the memory tier keeps
//! serving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::{CircuitState, TieredCache};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Operational with reduced cache effectiveness
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }

    /// Attach an informational message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Body of `/healthz` and `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status among the checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

// =============================================================================
// Tier Checks
// =============================================================================

/// Distributed tier status derived from the circuit breaker
pub fn check_distributed(cache: &TieredCache) -> HealthCheckResult {
    const NAME: &str = "distributed_tier";

    let Some(circuit) = cache.circuit() else {
        return HealthCheckResult::degraded(NAME, "memory-only mode");
    };
    let backend = cache.backend_name().unwrap_or("unknown");

    match circuit.state {
        CircuitState::Closed => HealthCheckResult::healthy(NAME).with_message(backend),
        CircuitState::HalfOpen => {
            HealthCheckResult::degraded(NAME, format!("{backend}: circuit half-open, testing recovery"))
        }
        CircuitState::Open => HealthCheckResult::degraded(
            NAME,
            format!(
                "{backend}: circuit open after {} failures, serving from memory",
                circuit.failure_count
            ),
        ),
    }
}

/// Memory tier occupancy
pub fn check_memory(cache: &TieredCache) -> HealthCheckResult {
    let memory = cache.memory();
    HealthCheckResult::healthy("memory_tier")
        .with_message(format!("{}/{} entries", memory.len(), memory.capacity()))
}

// =============================================================================
// Check State
// =============================================================================

/// Liveness/readiness flags plus uptime
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    fn flag_check(name: &str, up: bool, down_message: &str) -> HealthCheckResult {
        if up {
            HealthCheckResult::healthy(name)
        } else {
            HealthCheckResult::unhealthy(name, down_message)
        }
    }

    /// Liveness only
    pub fn liveness_report(&self) -> HealthResponse {
        let checks = vec![Self::flag_check("liveness", self.is_live(), "Service not live")];
        HealthResponse::new(checks, self.uptime())
    }

    /// Readiness plus both tiers
    pub fn report(&self, cache: &TieredCache) -> HealthResponse {
        let checks = vec![
            Self::flag_check("liveness", self.is_live(), "Service not live"),
            Self::flag_check("readiness", self.is_ready(), "Service not ready"),
            check_distributed(cache),
            check_memory(cache),
        ];
        HealthResponse::new(checks, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
