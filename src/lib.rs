//! Resilience layer for third-party commerce integrations.
//!
//! Wraps every outbound call in the same protective machinery: per-service
//! circuit breakers, background health probes, durable priority retry queues
//! with exponential backoff, and an opt-in chaos engine for failure drills.
//!
//! # Architecture
//!
//! ```text
//! execute_with_resilience(operation, service, payload, call):
//!   1. Health gate     — service already known down? queue the payload and
//!                        return ServiceUnavailable without calling
//!   2. Chaos overlay   — apply any active fault (delay / failure / crash)
//!   3. Circuit breaker — reject instantly while open, probe in half-open
//!   4. Call            — run the real downstream request
//!        ↓ retryable failure
//!   Retry queue (Redis sorted sets) — priority-ordered, exponential
//!   backoff with jitter, dead-letter once the budget is spent
//!        ↑
//!   Scheduler — background loop replaying queued items through the same
//!   gauntlet once the service recovers
//! ```
//!
//! # Example
//!
//! ```no_run
//! use integration_resilience::{
//!     presets, OperationError, OperationKind, Orchestrator, ResilienceConfig,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::connect(ResilienceConfig::from_env()?).await?;
//!     orchestrator.register_service("commerce", &presets::commerce_platform());
//!     orchestrator.start().await;
//!
//!     let payload = json!({"sku": "A-1", "quantity": 3});
//!     let result = orchestrator
//!         .execute_with_resilience(
//!             OperationKind::CreateOrder,
//!             "commerce",
//!             payload.clone(),
//!             || async {
//!                 // Your API call here
//!                 Ok::<_, OperationError>(json!({"order_id": 42}))
//!             },
//!         )
//!         .await?;
//!
//!     println!("created: {result}");
//!     Ok(())
//! }
//! ```

pub mod chaos;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod presets;
pub mod queue;
pub mod scheduler;
pub mod store;

// Re-export main types for convenience
pub use chaos::{ChaosEngine, ChaosExperiment, FaultKind, FaultSpec, ScenarioKind};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use config::{ResilienceConfig, RetryPolicy, SchedulerConfig};
pub use error::{FailureKind, OperationError, ResilienceError, Result};
pub use health::{HealthMonitor, HealthSummary, ServiceCheckConfig, ServiceHealth, ServiceProbe};
pub use orchestrator::{Orchestrator, OverallStatus, ResilienceStatus};
pub use presets::ServiceProfile;
pub use queue::{OperationKind, Priority, QueueItem, RetryQueue, RetryQueues};
pub use scheduler::{RetryDispatcher, SchedulerHandle};
pub use store::{DurableStore, MemoryStore, RedisStore};
