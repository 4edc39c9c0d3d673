//! Prometheus counters for the resilience layer, compiled in behind the
//! `metrics` feature. Without the feature every recorder is a no-op.

use crate::circuit_breaker::CircuitState;

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{register_int_counter_vec, IntCounterVec};

#[cfg(feature = "metrics")]
static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "resilience_circuit_breaker_transitions_total",
        "Total number of circuit breaker state transitions",
        &["service", "from", "to"]
    )
    .expect("Failed to register circuit breaker transitions metric")
});

#[cfg(feature = "metrics")]
static QUEUE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "resilience_queue_events_total",
        "Total number of retry queue events",
        &["queue", "event"]
    )
    .expect("Failed to register queue events metric")
});

#[cfg(feature = "metrics")]
static HEALTH_CHECKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "resilience_health_checks_total",
        "Total number of health check probes",
        &["service", "result"]
    )
    .expect("Failed to register health checks metric")
});

#[cfg(feature = "metrics")]
static OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "resilience_operations_total",
        "Total number of orchestrated operations",
        &["service", "operation", "outcome"]
    )
    .expect("Failed to register operations metric")
});

#[cfg(feature = "metrics")]
pub fn record_breaker_transition(service: &str, from: CircuitState, to: CircuitState) {
    BREAKER_TRANSITIONS
        .with_label_values(&[service, from.as_str(), to.as_str()])
        .inc();
}

#[cfg(feature = "metrics")]
pub fn record_queue_event(queue: &str, event: &str) {
    QUEUE_EVENTS.with_label_values(&[queue, event]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_health_check(service: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    HEALTH_CHECKS.with_label_values(&[service, result]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_operation(service: &str, operation: &str, outcome: &str) {
    OPERATIONS
        .with_label_values(&[service, operation, outcome])
        .inc();
}

// No-op implementations when the metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub fn record_breaker_transition(_service: &str, _from: CircuitState, _to: CircuitState) {}

#[cfg(not(feature = "metrics"))]
pub fn record_queue_event(_queue: &str, _event: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_health_check(_service: &str, _success: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_operation(_service: &str, _operation: &str, _outcome: &str) {}
