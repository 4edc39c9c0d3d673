//! Ready-made profiles for common integration classes.
//!
//! The numbers mirror production tuning: commerce platforms answer quickly
//! and tolerate frequent probing, shipping carriers throttle hard when
//! hammered and need a gentler trip wire with a longer cooldown.

use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;

/// Breaker thresholds plus health-probe cadence for one class of service.
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    pub circuit_breaker: CircuitBreakerConfig,
    /// How often the health monitor probes the service
    pub check_interval: Duration,
    /// Per-probe timeout
    pub probe_timeout: Duration,
}

impl Default for ServiceProfile {
    fn default() -> Self {
        commerce_platform()
    }
}

/// Order and inventory platform APIs.
pub fn commerce_platform() -> ServiceProfile {
    ServiceProfile {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        },
        check_interval: Duration::from_secs(30),
        probe_timeout: Duration::from_secs(10),
    }
}

/// Shipping carrier APIs. Carriers rate-limit aggressively, so the breaker
/// trips after three consecutive failures and waits two minutes before
/// probing, and two clean probes are enough to close it.
pub fn shipping_carrier() -> ServiceProfile {
    ServiceProfile {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(120),
        },
        check_interval: Duration::from_secs(60),
        probe_timeout: Duration::from_secs(15),
    }
}

/// SMS and email providers; cheap to probe, quick to answer.
pub fn notification_provider() -> ServiceProfile {
    ServiceProfile {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        },
        check_interval: Duration::from_secs(30),
        probe_timeout: Duration::from_secs(8),
    }
}
