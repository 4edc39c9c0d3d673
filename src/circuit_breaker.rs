//! Per-service circuit breakers.
//!
//! Each breaker tracks consecutive outcomes: `failure_threshold` failures in
//! a row open the circuit, rejected calls fail fast while open, and after
//! `recovery_timeout` the next call probes the dependency in half-open state.
//! `success_threshold` consecutive probe successes close the circuit again;
//! any probe failure reopens it and restarts the recovery clock.
//!
//! Breaker state is per-process by design. Sharing counters through the
//! store would put a network round-trip in front of every call and let one
//! instance's flapping poison the others; each instance converges on its own
//! view within a handful of calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OperationError, ResilienceError, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing fast, calls rejected without running
    Open,
    /// Probing recovery with live traffic
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Thresholds for a single breaker. All thresholds must be at least 1.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// How long to fail fast before probing recovery
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure_at: None,
        }
    }
}

/// Point-in-time snapshot for dashboards and the aggregate status report.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Seconds since the most recent recorded failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_failure: Option<f64>,
    /// Seconds until an open breaker will allow a recovery probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_secs: Option<f64>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Arc<RwLock<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Arc::new(RwLock::new(BreakerInner::new())),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `f` through the breaker. Rejected calls return
    /// [`ResilienceError::CircuitOpen`] without invoking `f`; failures from
    /// `f` are recorded and re-propagated as [`ResilienceError::Execution`].
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        self.ensure_call_permitted()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(ResilienceError::Execution(err))
            }
        }
    }

    /// Reject fast while open; flip to half-open once the recovery timeout
    /// has elapsed so the caller's request doubles as the probe.
    fn ensure_call_permitted(&self) -> Result<()> {
        {
            let inner = self.inner.read();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return Ok(()),
                CircuitState::Open => {
                    let elapsed = inner.opened_at.map(|at| at.elapsed());
                    if let Some(elapsed) = elapsed {
                        if elapsed < self.config.recovery_timeout {
                            return Err(ResilienceError::CircuitOpen {
                                service: self.service.clone(),
                                retry_in: Some(self.config.recovery_timeout - elapsed),
                            });
                        }
                    }
                }
            }
        }

        // Recovery timeout elapsed; re-check under the write lock since
        // another caller may have already flipped the state.
        let mut inner = self.inner.write();
        if inner.state == CircuitState::Open {
            let due = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true);
            if due {
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.consecutive_successes = 0;
            } else if let Some(at) = inner.opened_at {
                return Err(ResilienceError::CircuitOpen {
                    service: self.service.clone(),
                    retry_in: Some(
                        self.config.recovery_timeout.saturating_sub(at.elapsed()),
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                }
            }
            _ => {
                inner.consecutive_failures = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::HalfOpen => {
                // A single failed probe sends us straight back to open
                self.transition(&mut inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                inner.consecutive_failures += 1;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Trip the breaker by hand, e.g. ahead of a known dependency outage.
    pub fn force_open(&self) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open);
        }
        inner.opened_at = Some(Instant::now());
    }

    /// Clear all counters and close the circuit.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        *inner = BreakerInner::new();
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.read();
        let retry_in_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(at.elapsed())
                    .as_secs_f64(),
            ),
            _ => None,
        };
        CircuitBreakerStatus {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
            seconds_since_last_failure: inner
                .last_failure_at
                .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0),
            retry_in_secs,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        metrics::record_breaker_transition(&self.service, from, to);
        match to {
            CircuitState::Open => warn!(
                service = %self.service,
                consecutive_failures = inner.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                service = %self.service,
                "Circuit breaker half-open, probing recovery"
            ),
            CircuitState::Closed => info!(
                service = %self.service,
                "Circuit breaker closed"
            ),
        }
    }
}

/// Hands out one breaker per service name.
///
/// Profiles registered up front win over the default config; breakers are
/// created lazily on first use and shared by every clone of the registry.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    profiles: Arc<RwLock<HashMap<String, CircuitBreakerConfig>>>,
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            profiles: Arc::new(RwLock::new(HashMap::new())),
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Config override applied when the named service's breaker is created.
    pub fn set_profile(&self, service: impl Into<String>, config: CircuitBreakerConfig) {
        self.profiles.write().insert(service.into(), config);
    }

    pub fn breaker_for(&self, service: &str) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().get(service) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .profiles
                    .read()
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                CircuitBreaker::new(service, config)
            })
            .clone()
    }

    pub fn statuses(&self) -> HashMap<String, CircuitBreakerStatus> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.status()))
            .collect()
    }
}
