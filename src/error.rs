use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification attached to operation failures.
///
/// Transient failures are worth pushing through the retry queue; permanent
/// ones (validation rejections, malformed payloads) never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Error produced by a wrapped operation or retry dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub kind: FailureKind,
}

impl OperationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{:#}", err))
    }
}

/// Errors surfaced by the resilience layer
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Call rejected without running because the breaker is open
    #[error("Circuit breaker open for service '{service}'")]
    CircuitOpen {
        service: String,
        /// Time until the breaker will allow a recovery probe
        retry_in: Option<Duration>,
    },

    /// Health monitor reports the target service down
    #[error("Service '{service}' is unhealthy")]
    ServiceUnavailable { service: String },

    /// The wrapped operation ran and failed
    #[error("Operation failed: {0}")]
    Execution(#[from] OperationError),

    /// A queue item burned through its whole retry budget
    #[error("Item '{id}' dead-lettered after {retries} attempts")]
    QueueExhausted { id: String, retries: u32 },

    /// Failure injected by an active chaos experiment
    #[error("Chaos-injected {fault} failure for service '{service}'")]
    ChaosInjected { service: String, fault: String },

    /// Chaos operation requested while the engine is disabled
    #[error("Chaos engineering is disabled")]
    ChaosDisabled,

    /// Durable store command error
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResilienceError {
    /// Whether scheduling a retry makes sense for this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. }
            | Self::ServiceUnavailable { .. }
            | Self::ChaosInjected { .. }
            | Self::Store(_) => true,
            Self::Execution(op) => op.is_transient(),
            Self::QueueExhausted { .. }
            | Self::ChaosDisabled
            | Self::Serialization(_)
            | Self::Config(_) => false,
        }
    }
}

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;
