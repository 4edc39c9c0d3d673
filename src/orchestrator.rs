//! Ties the resilience patterns into one execution path.
//!
//! Every outbound call runs the same gauntlet: the health gate short-circuits
//! calls to services already known to be down (the work is queued instead of
//! burned against a dead endpoint), the chaos overlay applies any active
//! fault, and the circuit breaker wraps the call itself. Failures that are
//! worth retrying land in the retry queues on the way out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chaos::{ChaosEngine, ChaosStatus, ScenarioKind, ScenarioReport};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStatus};
use crate::config::ResilienceConfig;
use crate::error::{OperationError, ResilienceError, Result};
use crate::health::{HealthMonitor, HealthSummary, ServiceCheckConfig};
use crate::metrics;
use crate::presets::ServiceProfile;
use crate::queue::{OperationKind, QueueItem, QueueStats, RetryQueues};
use crate::scheduler::{self, RetryDispatcher, SchedulerHandle};
use crate::store::{DurableStore, RedisStore};

/// Rolled-up platform condition, worst signal wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Warning,
    Critical,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Healthy => "HEALTHY",
            OverallStatus::Degraded => "DEGRADED",
            OverallStatus::Warning => "WARNING",
            OverallStatus::Critical => "CRITICAL",
        }
    }
}

/// Point-in-time snapshot across every resilience component.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStatus {
    pub status: OverallStatus,
    /// Pending plus in-flight items across all retry queues.
    pub backlog: u64,
    pub health: HealthSummary,
    pub circuit_breakers: HashMap<String, CircuitBreakerStatus>,
    pub queues: HashMap<String, QueueStats>,
    pub chaos: ChaosStatus,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: ResilienceConfig,
    breakers: CircuitBreakerRegistry,
    health: HealthMonitor,
    queues: RetryQueues,
    chaos: ChaosEngine,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn DurableStore>, config: ResilienceConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(Default::default());
        let health = HealthMonitor::new(store.clone());
        let queues = RetryQueues::new(
            store.clone(),
            config.retry.clone(),
            config.visibility_timeout,
        );
        let chaos = ChaosEngine::new(store, config.chaos_enabled);
        Self {
            config,
            breakers,
            health,
            queues,
            chaos,
        }
    }

    /// Connect to the Redis named in the config and build on top of it.
    pub async fn connect(config: ResilienceConfig) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Register a service with its breaker tuning. Health is tracked
    /// passively (optimistic until the first observed failure) unless a
    /// probe is attached via [`register_probe`](Self::register_probe).
    pub fn register_service(&self, service: &str, profile: &ServiceProfile) {
        self.breakers
            .set_profile(service, profile.circuit_breaker.clone());
        self.health.ensure_service(service);
        info!(service = %service, "Service registered");
    }

    /// Attach an active health probe to a service.
    pub fn register_probe(&self, check: ServiceCheckConfig) {
        self.health.register_service(check);
    }

    /// Start the background health probe loops.
    pub async fn start(&self) {
        self.health.start_monitoring().await;
    }

    /// Stop probe loops. Queued work and breaker state survive.
    pub fn stop(&self) {
        self.health.stop_monitoring();
    }

    /// Spawn the background loop that drains the retry queues through the
    /// given dispatcher.
    pub fn spawn_scheduler(&self, dispatcher: Arc<dyn RetryDispatcher>) -> SchedulerHandle {
        scheduler::spawn(self.clone(), dispatcher)
    }

    /// Run one operation through the full gauntlet.
    ///
    /// An unhealthy service is not called at all: the payload is queued and
    /// the caller gets [`ResilienceError::ServiceUnavailable`]. Otherwise the
    /// call runs under any active chaos fault and the service's circuit
    /// breaker; retryable failures are queued before the error propagates,
    /// permanent ones propagate without queueing.
    pub async fn execute_with_resilience<F, Fut, T>(
        &self,
        operation: OperationKind,
        service: &str,
        payload: serde_json::Value,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        self.health.ensure_service(service);

        if !self.health.is_healthy(service) {
            let item = QueueItem::new(operation, service, payload)
                .with_max_retries(self.config.retry.max_retries)
                .with_error("service unhealthy at submission");
            let item_id = self.queues.push(&item).await?;
            warn!(
                service = %service,
                operation = %operation,
                item_id = %item_id,
                "Service unhealthy; operation queued instead of executed"
            );
            metrics::record_operation(service, operation.as_str(), "deferred");
            return Err(ResilienceError::ServiceUnavailable {
                service: service.to_string(),
            });
        }

        let outcome = match self.chaos.overlay(service).await {
            Ok(()) => self.breakers.breaker_for(service).call(f).await,
            // Injected failures fail the call without charging the breaker
            Err(err) => Err(err),
        };

        match outcome {
            Ok(value) => {
                metrics::record_operation(service, operation.as_str(), "ok");
                Ok(value)
            }
            Err(err) => {
                if err.is_retryable() {
                    let item = QueueItem::new(operation, service, payload)
                        .with_max_retries(self.config.retry.max_retries)
                        .with_error(err.to_string());
                    let item_id = self.queues.push(&item).await?;
                    warn!(
                        service = %service,
                        operation = %operation,
                        item_id = %item_id,
                        error = %err,
                        "Operation failed; queued for retry"
                    );
                    metrics::record_operation(service, operation.as_str(), "queued");
                } else {
                    debug!(
                        service = %service,
                        operation = %operation,
                        error = %err,
                        "Operation failed permanently; not queued"
                    );
                    metrics::record_operation(service, operation.as_str(), "failed");
                }
                Err(err)
            }
        }
    }

    /// Aggregate status across health, breakers, queues and chaos.
    ///
    /// Backlog over 100 items is critical; over 50 items or service health
    /// under 80% is a warning; over 10 items or health under 95% means
    /// degraded.
    pub async fn overall_status(&self) -> Result<ResilienceStatus> {
        let health = self.health.summary();
        let queues = self.queues.stats().await?;
        let backlog: u64 = queues.values().map(|s| s.pending + s.processing).sum();

        let status = if backlog > 100 {
            OverallStatus::Critical
        } else if backlog > 50 || health.health_percentage < 80.0 {
            OverallStatus::Warning
        } else if backlog > 10 || health.health_percentage < 95.0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        Ok(ResilienceStatus {
            status,
            backlog,
            health,
            circuit_breakers: self.breakers.statuses(),
            queues,
            chaos: self.chaos.status(),
            generated_at: Utc::now(),
        })
    }

    /// Launch a chaos scenario against every tracked service.
    pub async fn run_scenario(&self, scenario: ScenarioKind) -> Result<ScenarioReport> {
        let mut services: Vec<String> = self.health.all_health().into_keys().collect();
        services.sort();
        self.chaos.run_scenario(scenario, &services).await
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn queues(&self) -> &RetryQueues {
        &self.queues
    }

    pub fn chaos(&self) -> &ChaosEngine {
        &self.chaos
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ServiceProbe;
    use crate::presets;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FailingProbe;

    #[async_trait::async_trait]
    impl ServiceProbe for FailingProbe {
        async fn probe(&self) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryStore::new()),
            ResilienceConfig::test_defaults(),
        )
    }

    async fn mark_unhealthy(orchestrator: &Orchestrator, service: &str) {
        orchestrator.register_probe(
            ServiceCheckConfig::custom(service, Arc::new(FailingProbe))
                .with_interval(Duration::from_millis(5)),
        );
        orchestrator.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.stop();
        assert!(!orchestrator.health().is_healthy(service));
    }

    #[tokio::test]
    async fn healthy_calls_pass_through() {
        let orchestrator = orchestrator();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = orchestrator
            .execute_with_resilience(
                OperationKind::CreateOrder,
                "commerce",
                json!({"order": 1}),
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, OperationError>(json!({"status": "created"}))
                },
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"status": "created"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = orchestrator.queues().stats().await.unwrap();
        assert!(stats.values().all(|s| s.pending == 0));
    }

    #[tokio::test]
    async fn unhealthy_service_queues_without_calling() {
        let orchestrator = orchestrator();
        mark_unhealthy(&orchestrator, "commerce").await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = orchestrator
            .execute_with_resilience(
                OperationKind::CreateOrder,
                "commerce",
                json!({"order": 7}),
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, OperationError>(json!(null))
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::ServiceUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let pending = orchestrator
            .queues()
            .for_operation(OperationKind::CreateOrder)
            .peek_pending(10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].service, "commerce");
    }

    #[tokio::test]
    async fn open_breaker_rejects_and_queues() {
        let orchestrator = orchestrator();
        orchestrator.breakers().breaker_for("carrier").force_open();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = orchestrator
            .execute_with_resilience(
                OperationKind::CreateFulfillment,
                "carrier",
                json!({"shipment": 1}),
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, OperationError>(json!(null))
                },
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let stats = orchestrator.queues().stats().await.unwrap();
        assert_eq!(stats["fulfillments"].pending, 1);
    }

    #[tokio::test]
    async fn transient_failures_queue_and_propagate() {
        let orchestrator = orchestrator();
        let result: Result<serde_json::Value> = orchestrator
            .execute_with_resilience(
                OperationKind::SendEmail,
                "notifications",
                json!({"to": "ops"}),
                || async { Err(OperationError::transient("smtp timeout")) },
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Execution(_))));
        let stats = orchestrator.queues().stats().await.unwrap();
        assert_eq!(stats["notifications"].pending, 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_queued() {
        let orchestrator = orchestrator();
        let result: Result<serde_json::Value> = orchestrator
            .execute_with_resilience(
                OperationKind::CreateOrder,
                "commerce",
                json!({"order": -1}),
                || async { Err(OperationError::permanent("invalid order payload")) },
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Execution(_))));
        let stats = orchestrator.queues().stats().await.unwrap();
        assert!(stats.values().all(|s| s.pending == 0));
    }

    #[tokio::test]
    async fn chaos_failures_bypass_the_breaker() {
        let orchestrator = orchestrator();
        orchestrator.chaos().set_enabled(true);
        orchestrator
            .chaos()
            .inject_failure_rate("commerce", 1.0, Duration::from_secs(60))
            .await
            .unwrap();

        for _ in 0..10 {
            let result: Result<serde_json::Value> = orchestrator
                .execute_with_resilience(
                    OperationKind::UpdateInventory,
                    "commerce",
                    json!({"sku": "A"}),
                    || async { Ok(json!(null)) },
                )
                .await;
            assert!(matches!(
                result,
                Err(ResilienceError::ChaosInjected { .. })
            ));
        }

        // Ten injected failures, breaker untouched
        use crate::circuit_breaker::CircuitState;
        assert_eq!(
            orchestrator
                .breakers()
                .breaker_for("commerce")
                .current_state(),
            CircuitState::Closed
        );
        let stats = orchestrator.queues().stats().await.unwrap();
        assert_eq!(stats["orders"].pending, 10);
    }

    #[tokio::test]
    async fn overall_status_reflects_backlog_and_health() {
        let orchestrator = orchestrator();
        let status = orchestrator.overall_status().await.unwrap();
        assert_eq!(status.status, OverallStatus::Healthy);
        assert_eq!(status.backlog, 0);

        for i in 0..12 {
            orchestrator
                .queues()
                .push(&QueueItem::new(
                    OperationKind::SendSms,
                    "notifications",
                    json!({ "n": i }),
                ))
                .await
                .unwrap();
        }
        let status = orchestrator.overall_status().await.unwrap();
        assert_eq!(status.status, OverallStatus::Degraded);
        assert_eq!(status.backlog, 12);

        for i in 0..89 {
            orchestrator
                .queues()
                .push(&QueueItem::new(
                    OperationKind::SendSms,
                    "notifications",
                    json!({ "m": i }),
                ))
                .await
                .unwrap();
        }
        let status = orchestrator.overall_status().await.unwrap();
        assert_eq!(status.status, OverallStatus::Critical);
    }

    #[tokio::test]
    async fn unhealthy_services_degrade_overall_status() {
        let orchestrator = orchestrator();
        mark_unhealthy(&orchestrator, "carrier").await;

        // One unhealthy service out of one registered: 0% healthy
        let status = orchestrator.overall_status().await.unwrap();
        assert_eq!(status.status, OverallStatus::Warning);
    }

    #[tokio::test]
    async fn scenarios_target_tracked_services() {
        let orchestrator = orchestrator();
        orchestrator.chaos().set_enabled(true);

        let result = orchestrator.run_scenario(ScenarioKind::TotalBlackout).await;
        assert!(matches!(result, Err(ResilienceError::Config(_))));

        orchestrator.register_service("commerce", &presets::commerce_platform());
        orchestrator.register_service("carrier", &presets::shipping_carrier());
        let report = orchestrator
            .run_scenario(ScenarioKind::TotalBlackout)
            .await
            .unwrap();
        assert_eq!(report.experiment_ids.len(), 2);
    }
}
