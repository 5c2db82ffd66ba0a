//! Circuit Breaker for the Distributed Tier
//!
//! Closed -> Open after `failure_threshold` consecutive failures,
//! Open -> HalfOpen once `recovery_timeout` has elapsed since the last failure,
//! HalfOpen -> Closed on the next success, HalfOpen -> Open on the next failure.
//!
//! State lives behind its own lock so slow remote calls never contend with
//! the memory tier's map lock.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Times the breaker has tripped open
    trips: u64,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_params(config.failure_threshold, config.recovery_timeout())
    }

    /// Create a closed breaker from raw parameters
    pub fn with_params(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trips: 0,
            }),
        }
    }

    /// Whether a call may proceed. An open breaker whose recovery timeout has
    /// elapsed moves to HalfOpen and admits the call.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker half-open, admitting trial call");
                }
                elapsed
            }
        }
    }

    /// Record a successful remote call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit breaker closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    /// Record a failed remote call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.trips += 1;
                warn!(
                    failure_count = inner.failure_count,
                    threshold = self.failure_threshold,
                    "Circuit breaker opened, distributed tier bypassed"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trips += 1;
                warn!("Circuit breaker reopened after failed trial call");
            }
            _ => {}
        }
    }

    /// Current state without triggering the Open -> HalfOpen check
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Point-in-time view for status reporting
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs(),
            seconds_since_last_failure: inner.last_failure.map(|at| at.elapsed().as_secs()),
            trips: inner.trips,
        }
    }
}

/// Serializable breaker status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub seconds_since_last_failure: Option<u64>,
    pub trips: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::with_params(3, Duration::from_secs(30))
    }

    #[test]
    fn test_starts_closed() {
        let breaker = breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.snapshot().trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.snapshot().trips, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = breaker().snapshot();
        assert_eq!(snapshot.failure_threshold, 3);
        assert_eq!(snapshot.seconds_since_last_failure, None);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"Closed\""));
    }
}
