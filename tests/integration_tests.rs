/// Integration tests for the resilience layer
use integration_resilience::{
    presets, queue::FailOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    HealthMonitor, MemoryStore, OperationError, OperationKind, Orchestrator, Priority, QueueItem,
    ResilienceConfig, ResilienceError, RetryDispatcher, RetryPolicy, RetryQueue, ScenarioKind,
    ServiceCheckConfig, ServiceHealth, ServiceProbe,
};

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ScriptedProbe {
    calls: AtomicU32,
    fail_first: u32,
}

impl ScriptedProbe {
    fn down() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        })
    }

    fn recovering_after(n: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: n,
        })
    }
}

#[async_trait]
impl ServiceProbe for ScriptedProbe {
    async fn probe(&self) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("probe refused");
        }
        Ok(())
    }
}

struct ScriptedDispatcher {
    calls: AtomicU32,
    fail_first: u32,
}

impl ScriptedDispatcher {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
        })
    }

    fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        })
    }
}

#[async_trait]
impl RetryDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, _item: &QueueItem) -> anyhow::Result<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("downstream unavailable");
        }
        Ok(json!({"ok": true}))
    }
}

fn fast_orchestrator(chaos_enabled: bool) -> Orchestrator {
    let mut config = ResilienceConfig::default();
    config.chaos_enabled = chaos_enabled;
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.unhealthy_defer = Duration::from_millis(20);
    config.retry = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_secs(1),
        jitter: 0.0,
    };
    Orchestrator::new(Arc::new(MemoryStore::new()), config)
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ==================== Circuit Breaker Tests ====================

#[tokio::test]
async fn test_breaker_opens_at_exact_threshold_and_rejects_without_calling() {
    // Default commerce tuning: 5 consecutive failures open the circuit
    let cb = CircuitBreaker::new("commerce", CircuitBreakerConfig::default());

    for _ in 0..4 {
        let _ = cb
            .call(|| async { Err::<(), _>(OperationError::transient("503")) })
            .await;
    }
    assert_eq!(cb.current_state(), CircuitState::Closed);

    let _ = cb
        .call(|| async { Err::<(), _>(OperationError::transient("503")) })
        .await;
    assert_eq!(cb.current_state(), CircuitState::Open);

    // The rejected call never reaches the wrapped function
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = cb
        .call(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(())
        })
        .await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_breaker_recovery_cycle() {
    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        recovery_timeout: Duration::from_millis(50),
    };
    let cb = CircuitBreaker::new("commerce", config);

    // Phase 1: Closed -> Open (3 failures)
    for _ in 0..3 {
        let _ = cb
            .call(|| async { Err::<(), _>(OperationError::transient("boom")) })
            .await;
    }
    assert_eq!(cb.current_state(), CircuitState::Open);

    // Phase 2: Open -> HalfOpen after the recovery timeout
    tokio::time::sleep(Duration::from_millis(80)).await;
    cb.call(|| async { Ok::<_, OperationError>(()) })
        .await
        .unwrap();
    assert_eq!(cb.current_state(), CircuitState::HalfOpen);

    // Phase 3: HalfOpen -> Closed (2 successes)
    cb.call(|| async { Ok::<_, OperationError>(()) })
        .await
        .unwrap();
    assert_eq!(cb.current_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_breaker_halfopen_failure_reopens() {
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 2,
        recovery_timeout: Duration::from_millis(50),
    };
    let cb = CircuitBreaker::new("carrier", config);

    for _ in 0..2 {
        let _ = cb
            .call(|| async { Err::<(), _>(OperationError::transient("down")) })
            .await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    // One probe failure puts the breaker straight back to Open
    let _ = cb
        .call(|| async { Err::<(), _>(OperationError::transient("still down")) })
        .await;
    assert_eq!(cb.current_state(), CircuitState::Open);

    let result = cb.call(|| async { Ok::<_, OperationError>(()) }).await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
}

#[tokio::test]
async fn test_carrier_profile_trips_after_three_failures() {
    let profile = presets::shipping_carrier();
    assert_eq!(profile.circuit_breaker.failure_threshold, 3);
    assert_eq!(profile.circuit_breaker.success_threshold, 2);
    assert_eq!(
        profile.circuit_breaker.recovery_timeout,
        Duration::from_secs(120)
    );

    let cb = CircuitBreaker::new("carrier", profile.circuit_breaker);
    for _ in 0..3 {
        let _ = cb
            .call(|| async { Err::<(), _>(OperationError::transient("timeout")) })
            .await;
    }
    assert_eq!(cb.current_state(), CircuitState::Open);
}

// ==================== Health Monitor Tests ====================

#[test]
fn test_uptime_percentage_tracks_failures() {
    let mut health = ServiceHealth::new("commerce");
    for i in 0..10 {
        let success = i % 3 != 0; // checks 0, 3, 6, 9 fail
        health.record_check(success, Duration::from_millis(20), None);
    }

    assert_eq!(health.total_checks, 10);
    assert_eq!(health.total_failures, 4);
    assert_eq!(health.uptime_percentage(), 60.0);

    let mut health = ServiceHealth::new("carrier");
    for i in 0..10 {
        health.record_check(i >= 3, Duration::from_millis(20), None);
    }
    assert_eq!(health.total_failures, 3);
    assert_eq!(health.uptime_percentage(), 70.0);
}

#[tokio::test]
async fn test_probe_loop_marks_service_unhealthy_then_recovers() {
    let monitor = HealthMonitor::new(Arc::new(MemoryStore::new()));
    let probe = ScriptedProbe::recovering_after(2);
    monitor.register_service(
        ServiceCheckConfig::custom("payments", probe.clone())
            .with_interval(Duration::from_millis(10)),
    );
    monitor.start_monitoring().await;

    // First two probes fail
    wait_for("payments to go unhealthy", || !monitor.is_healthy("payments")).await;

    // Third and later probes succeed
    wait_for("payments to recover", || monitor.is_healthy("payments")).await;
    monitor.stop_monitoring();

    let health = monitor.health("payments").unwrap();
    assert_eq!(health.total_failures, 2);
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.last_success.is_some());
    assert!(health.last_failure.is_some());
}

#[tokio::test]
async fn test_summary_surfaces_most_failing_services() {
    let monitor = HealthMonitor::new(Arc::new(MemoryStore::new()));
    monitor.register_service(
        ServiceCheckConfig::custom("payments", ScriptedProbe::down())
            .with_interval(Duration::from_millis(10)),
    );
    monitor.register_service(
        ServiceCheckConfig::custom("commerce", ScriptedProbe::recovering_after(0))
            .with_interval(Duration::from_millis(10)),
    );
    monitor.start_monitoring().await;

    wait_for("payments to fail repeatedly", || {
        monitor
            .health("payments")
            .map(|h| h.consecutive_failures >= 2)
            .unwrap_or(false)
    })
    .await;
    monitor.stop_monitoring();

    let summary = monitor.summary();
    assert_eq!(summary.total_services, 2);
    assert_eq!(summary.healthy_services, 1);
    assert_eq!(summary.unhealthy_services, 1);
    assert_eq!(summary.health_percentage, 50.0);
    assert_eq!(summary.most_failing[0].service, "payments");
}

// ==================== Retry Queue Tests ====================

#[tokio::test]
async fn test_pop_follows_priority_not_insertion_order() {
    let queue = RetryQueue::new(
        "orders",
        Arc::new(MemoryStore::new()),
        RetryPolicy::default(),
        Duration::from_secs(60),
    );

    // Inserted low, critical, medium
    queue
        .push(
            &QueueItem::new(OperationKind::ListOrders, "commerce", json!({"page": 1}))
                .with_priority(Priority::Low),
        )
        .await
        .unwrap();
    queue
        .push(
            &QueueItem::new(OperationKind::CreateOrder, "commerce", json!({"order": 2}))
                .with_priority(Priority::Critical),
        )
        .await
        .unwrap();
    queue
        .push(
            &QueueItem::new(OperationKind::SendSms, "commerce", json!({"note": 3}))
                .with_priority(Priority::Medium),
        )
        .await
        .unwrap();

    // Popped critical, medium, low
    let order: Vec<Priority> = [
        queue.pop().await.unwrap().unwrap(),
        queue.pop().await.unwrap().unwrap(),
        queue.pop().await.unwrap().unwrap(),
    ]
    .iter()
    .map(|item| item.priority)
    .collect();
    assert_eq!(order, vec![Priority::Critical, Priority::Medium, Priority::Low]);
}

#[test]
fn test_backoff_schedule_follows_exponential_curve() {
    let policy = RetryPolicy::default();

    // First retry: 300s +/- 25% jitter
    let first = policy.delay_for(0).as_secs_f64();
    assert!((225.0..=375.0).contains(&first), "first delay {first}");

    // Second retry: 600s +/- 25%
    let second = policy.delay_for(1).as_secs_f64();
    assert!((450.0..=750.0).contains(&second), "second delay {second}");

    // Deep retries jitter downward only; 24h is a hard ceiling
    for _ in 0..50 {
        let capped = policy.delay_for(10).as_secs_f64();
        assert!(
            (64_800.0..=86_400.0).contains(&capped),
            "capped delay {capped}"
        );
    }
}

#[tokio::test]
async fn test_failed_items_reschedule_into_the_future() {
    let queue = RetryQueue::new(
        "orders",
        Arc::new(MemoryStore::new()),
        RetryPolicy::default(),
        Duration::from_secs(60),
    );
    queue
        .push(&QueueItem::new(
            OperationKind::CreateOrder,
            "commerce",
            json!({"order": 9}),
        ))
        .await
        .unwrap();

    let item = queue.pop().await.unwrap().unwrap();
    let before = chrono::Utc::now();
    let outcome = queue.fail(&item, "gateway timeout").await.unwrap();

    match outcome {
        FailOutcome::Rescheduled {
            retry_count,
            next_retry_at,
        } => {
            assert_eq!(retry_count, 1);
            let delay = (next_retry_at - before).num_seconds();
            assert!((224..=376).contains(&delay), "delay {delay}s");
        }
        FailOutcome::DeadLettered => panic!("first failure must reschedule"),
    }

    // Parked in the delayed bucket: counted as pending, not yet poppable
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 0);
    assert!(queue.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dead_letter_exactly_once() {
    let policy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_secs(1),
        jitter: 0.0,
    };
    let queue = RetryQueue::new(
        "notifications",
        Arc::new(MemoryStore::new()),
        policy,
        Duration::from_secs(60),
    );
    queue
        .push(&QueueItem::new(
            OperationKind::SendEmail,
            "smtp",
            json!({"to": "ops"}),
        ))
        .await
        .unwrap();

    let mut rescheduled = 0;
    let mut dead = false;
    for _ in 0..100 {
        queue.promote_due().await.unwrap();
        let Some(item) = queue.pop().await.unwrap() else {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };
        match queue.fail(&item, "mailbox full").await.unwrap() {
            FailOutcome::Rescheduled { .. } => rescheduled += 1,
            FailOutcome::DeadLettered => {
                dead = true;
                break;
            }
        }
    }

    // One reschedule, then the failure that reaches max_retries dead-letters
    assert!(dead);
    assert_eq!(rescheduled, 1);
    let letters = queue.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_count, 2);
    assert_eq!(letters[0].last_error.as_deref(), Some("mailbox full"));

    queue.promote_due().await.unwrap();
    assert!(queue.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_claims_return_to_pending() {
    let queue = RetryQueue::new(
        "orders",
        Arc::new(MemoryStore::new()),
        RetryPolicy::default(),
        Duration::from_millis(50),
    );
    queue
        .push(&QueueItem::new(
            OperationKind::UpdateInventory,
            "commerce",
            json!({"sku": "B-2"}),
        ))
        .await
        .unwrap();

    // Consumer claims the item and dies
    let claimed = queue.pop().await.unwrap().unwrap();
    assert_eq!(queue.stats().await.unwrap().processing, 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(queue.recover_expired().await.unwrap(), 1);

    // The item is claimable again and completes normally
    let recovered = queue.pop().await.unwrap().unwrap();
    assert_eq!(recovered.id, claimed.id);
    queue.complete(&recovered.id).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.completed, 1);
}

// ==================== Chaos Engine Tests ====================

#[tokio::test]
async fn test_full_failure_rate_then_emergency_stop() {
    let orchestrator = fast_orchestrator(true);
    let chaos = orchestrator.chaos();
    chaos
        .inject_failure_rate("commerce", 1.0, Duration::from_secs(60))
        .await
        .unwrap();
    chaos
        .inject_failure_rate("carrier", 1.0, Duration::from_secs(60))
        .await
        .unwrap();

    // Phase 1: every overlay fails
    for service in ["commerce", "carrier"] {
        for _ in 0..3 {
            let result = chaos.overlay(service).await;
            assert!(matches!(result, Err(ResilienceError::ChaosInjected { .. })));
        }
    }

    // Phase 2: emergency stop restores normal behavior
    assert_eq!(chaos.emergency_stop_all().await.unwrap(), 2);
    chaos.overlay("commerce").await.unwrap();
    chaos.overlay("carrier").await.unwrap();

    // Phase 3: a second emergency stop finds nothing
    assert_eq!(chaos.emergency_stop_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_chaos_disabled_is_inert() {
    let orchestrator = fast_orchestrator(false);
    let result = orchestrator
        .chaos()
        .inject_delay("commerce", Duration::from_millis(10), Duration::from_secs(60))
        .await;
    assert!(matches!(result, Err(ResilienceError::ChaosDisabled)));

    let value = orchestrator
        .execute_with_resilience(
            OperationKind::CreateOrder,
            "commerce",
            json!({"order": 1}),
            || async { Ok::<_, OperationError>(json!({"id": 1})) },
        )
        .await
        .unwrap();
    assert_eq!(value, json!({"id": 1}));
}

#[tokio::test]
async fn test_blackout_scenario_fails_calls_without_tripping_breakers() {
    let orchestrator = fast_orchestrator(true);
    orchestrator.register_service("commerce", &presets::commerce_platform());
    orchestrator.register_service("carrier", &presets::shipping_carrier());

    let report = orchestrator
        .run_scenario(ScenarioKind::TotalBlackout)
        .await
        .unwrap();
    assert_eq!(report.experiment_ids.len(), 2);

    for i in 0..5 {
        let result = orchestrator
            .execute_with_resilience(
                OperationKind::CreateOrder,
                "commerce",
                json!({ "order": i }),
                || async { Ok::<_, OperationError>(json!(null)) },
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::ChaosInjected { .. })));
    }

    // Injected failures never charge the circuit breaker
    assert_eq!(
        orchestrator
            .breakers()
            .breaker_for("commerce")
            .current_state(),
        CircuitState::Closed
    );

    orchestrator.chaos().emergency_stop_all().await.unwrap();
    orchestrator
        .execute_with_resilience(
            OperationKind::CreateOrder,
            "commerce",
            json!({"order": 99}),
            || async { Ok::<_, OperationError>(json!(null)) },
        )
        .await
        .unwrap();
}

// ==================== Orchestrator Tests ====================

#[tokio::test]
async fn test_unhealthy_service_defers_instead_of_calling() {
    let orchestrator = fast_orchestrator(false);
    orchestrator.register_probe(
        ServiceCheckConfig::custom("commerce", ScriptedProbe::down())
            .with_interval(Duration::from_millis(10)),
    );
    orchestrator.start().await;
    wait_for("commerce to go unhealthy", || {
        !orchestrator.health().is_healthy("commerce")
    })
    .await;
    orchestrator.stop();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = orchestrator
        .execute_with_resilience(
            OperationKind::CreateOrder,
            "commerce",
            json!({"order": 42}),
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

    // Exactly one item queued, payload intact
    let stats = orchestrator.queues().stats().await.unwrap();
    let total_pending: u64 = stats.values().map(|s| s.pending).sum();
    assert_eq!(total_pending, 1);
    let pending = orchestrator
        .queues()
        .for_operation(OperationKind::CreateOrder)
        .peek_pending(10)
        .await
        .unwrap();
    assert_eq!(pending[0].payload, json!({"order": 42}));
    assert_eq!(pending[0].priority, Priority::Critical);
}

#[tokio::test]
async fn test_repeated_failures_trip_the_breaker_through_the_orchestrator() {
    let orchestrator = fast_orchestrator(false);
    orchestrator.register_service("commerce", &presets::commerce_platform());

    // Five transient failures open the circuit and each one is queued
    for i in 0..5 {
        let result: Result<serde_json::Value, _> = orchestrator
            .execute_with_resilience(
                OperationKind::CreateOrder,
                "commerce",
                json!({ "attempt": i }),
                || async { Err(OperationError::transient("gateway timeout")) },
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Execution(_))));
    }
    assert_eq!(
        orchestrator
            .breakers()
            .breaker_for("commerce")
            .current_state(),
        CircuitState::Open
    );

    // The sixth call is rejected before the function runs, and still queued
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = orchestrator
        .execute_with_resilience(
            OperationKind::CreateOrder,
            "commerce",
            json!({"attempt": 5}),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>(json!(null))
            },
        )
        .await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stats = orchestrator.queues().stats().await.unwrap();
    assert_eq!(stats["orders"].pending, 6);
}

#[tokio::test]
async fn test_permanent_failures_skip_the_queue() {
    let orchestrator = fast_orchestrator(false);
    let result: Result<serde_json::Value, _> = orchestrator
        .execute_with_resilience(
            OperationKind::CreateOrder,
            "commerce",
            json!({"order": "bad"}),
            || async { Err(OperationError::permanent("422 unprocessable")) },
        )
        .await;

    match result {
        Err(ResilienceError::Execution(err)) => assert!(!err.is_transient()),
        other => panic!("expected execution error, got {other:?}"),
    }
    let stats = orchestrator.queues().stats().await.unwrap();
    assert!(stats.values().all(|s| s.pending == 0 && s.failed == 0));
}

// ==================== Scheduler Tests ====================

#[tokio::test]
async fn test_recovery_drains_deferred_work_end_to_end() {
    let orchestrator = fast_orchestrator(false);

    // Service starts down, recovers after three probes
    orchestrator.register_probe(
        ServiceCheckConfig::custom("commerce", ScriptedProbe::recovering_after(3))
            .with_interval(Duration::from_millis(10)),
    );
    orchestrator.start().await;
    wait_for("commerce to go unhealthy", || {
        !orchestrator.health().is_healthy("commerce")
    })
    .await;

    // Submission while down: queued, never executed
    let result = orchestrator
        .execute_with_resilience(
            OperationKind::CreateOrder,
            "commerce",
            json!({"order": 7}),
            || async { Ok::<_, OperationError>(json!(null)) },
        )
        .await;
    assert!(matches!(
        result,
        Err(ResilienceError::ServiceUnavailable { .. })
    ));

    // The scheduler replays the item once the service recovers
    let dispatcher = ScriptedDispatcher::succeeding();
    let handle = orchestrator.spawn_scheduler(dispatcher.clone());
    wait_for("commerce to recover", || {
        orchestrator.health().is_healthy("commerce")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.shutdown().await;
    orchestrator.stop();

    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    let stats = orchestrator.queues().stats().await.unwrap();
    assert_eq!(stats["orders"].pending, 0);
    assert_eq!(stats["orders"].processing, 0);
    assert_eq!(stats["orders"].completed, 1);
}

#[tokio::test]
async fn test_scheduler_dead_letters_after_budget_is_spent() {
    let orchestrator = fast_orchestrator(false);
    orchestrator
        .queues()
        .push(&QueueItem::new(
            OperationKind::SendSms,
            "sms-gateway",
            json!({"to": "+15550100"}),
        ))
        .await
        .unwrap();

    let dispatcher = ScriptedDispatcher::always_failing();
    let handle = orchestrator.spawn_scheduler(dispatcher.clone());
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.shutdown().await;

    // Initial attempt plus one retry before the budget of 2 is spent
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    let stats = orchestrator.queues().stats().await.unwrap();
    assert_eq!(stats["notifications"].failed, 1);
    assert_eq!(stats["notifications"].pending, 0);

    let dead = orchestrator
        .queues()
        .for_operation(OperationKind::SendSms)
        .dead_letters()
        .await
        .unwrap();
    assert_eq!(dead[0].retry_count, 2);
}
