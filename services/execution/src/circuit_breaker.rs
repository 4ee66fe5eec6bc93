//! Per-relay circuit breaker
//!
//! Closed → Open after `failure_threshold` consecutive transient failures.
//! Open → HalfOpen once `reset_timeout_ms` has passed, admitting exactly one
//! trial call. A successful trial closes the circuit, a failed one reopens it.
//! A trial whose future is dropped before settling frees the trial slot.

use crate::error::RelayError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failing - calls are refused without contacting the relay
    Open,
    /// Testing recovery - a single trial call is allowed
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening
    pub failure_threshold: u32,
    /// Time spent open before a trial is admitted
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Thread-safe breaker guarding one relay
#[derive(Debug)]
pub struct CircuitBreaker {
    relay: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,

    // Metrics
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    refused_calls: AtomicU64,
    circuit_opens: AtomicU64,
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub relay: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub refused_calls: u64,
    pub circuit_opens: u64,
}

impl CircuitBreaker {
    pub fn new(relay: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            relay: relay.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            refused_calls: AtomicU64::new(0),
            circuit_opens: AtomicU64::new(0),
        }
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }

    /// Ask to place one call. Refused with `CircuitOpen` while open, or while
    /// half-open with a trial already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, RelayError> {
        let mut inner = self.inner.lock();

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout())
                    .unwrap_or(true);
                if !elapsed {
                    return Err(self.refuse());
                }
                inner.state = CircuitState::HalfOpen;
                info!(relay = %self.relay, "🔄 Circuit breaker half-open, admitting trial");
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.refuse());
                }
                inner.trial_in_flight = true;
                true
            }
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(CallPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn refuse(&self) -> RelayError {
        self.refused_calls.fetch_add(1, Ordering::Relaxed);
        RelayError::CircuitOpen {
            relay: self.relay.clone(),
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(relay = %self.relay, "✅ Circuit breaker closed after successful trial");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            // Late result of a call admitted before the circuit opened
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.circuit_opens.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        relay = %self.relay,
                        failures = inner.consecutive_failures,
                        "🚨 Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                self.circuit_opens.fetch_add(1, Ordering::Relaxed);
                warn!(relay = %self.relay, "🚨 Trial failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            relay: self.relay.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            refused_calls: self.refused_calls.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!(relay = %self.relay, "Circuit breaker reset");
    }
}

/// Admission to call a relay once. Settle it with `record_success` or
/// `record_failure`; dropping it unsettled counts as neither.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

/// Lazily created breakers keyed by relay name
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, relay: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(relay) {
            return Arc::clone(breaker.value());
        }
        let breaker = self
            .breakers
            .entry(relay.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(relay, self.config.clone())));
        Arc::clone(breaker.value())
    }

    pub fn state(&self, relay: &str) -> CircuitState {
        self.breakers
            .get(relay)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.relay.cmp(&b.relay));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "relay-a",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 1_000,
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);

        for _ in 0..2 {
            cb.try_acquire().unwrap().record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(RelayError::CircuitOpen { .. })));
        assert_eq!(cb.metrics().refused_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(2);
        cb.try_acquire().unwrap().record_failure();
        cb.try_acquire().unwrap().record_success();
        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_reset_timeout() {
        let cb = breaker(1);
        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err(), "second trial must be refused");

        trial.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(1);
        cb.try_acquire().unwrap().record_failure();
        tokio::time::advance(Duration::from_millis(1_001)).await;

        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.metrics().circuit_opens, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let cb = breaker(1);
        cb.try_acquire().unwrap().record_failure();
        tokio::time::advance(Duration::from_millis(1_001)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get("flashbots");
        let b = registry.get("flashbots");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.state("unknown"), CircuitState::Closed);
        assert_eq!(registry.metrics().len(), 1);
    }
}
