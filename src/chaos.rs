//! Controlled fault injection for resilience drills.
//!
//! Experiments write an active-fault record into the store under
//! `chaos:{service}:{fault}`, TTL'd to the experiment duration plus a grace
//! margin so records age out even if cleanup never runs. The execution path
//! overlays the active fault on every call: delays sleep, failure and crash
//! faults roll the dice and inject an error, resource faults throttle.
//!
//! Every injection spawns a completion timer tracked by experiment id, so
//! experiments can be stopped early and an emergency stop can cancel
//! everything at once. The whole engine sits behind an enable switch that
//! defaults to off; production traffic never sees a fault unless somebody
//! opted in.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::store::DurableStore;

/// Records outlive their experiment by this much before the TTL reaps them.
const FAULT_TTL_GRACE: Duration = Duration::from_secs(60);
const DEFAULT_SCENARIO_STAGGER: Duration = Duration::from_secs(120);

const STORM_DELAY_TTL: Duration = Duration::from_secs(300);
const STORM_FAILURE_TTL: Duration = Duration::from_secs(180);
const CASCADE_CRASH_TTL: Duration = Duration::from_secs(600);
const CASCADE_DOWNSTREAM_TTL: Duration = Duration::from_secs(300);
const CRUNCH_TTL: Duration = Duration::from_secs(240);
const BLACKOUT_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Delay,
    FailureRate,
    Crash,
    ResourceExhaustion,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Delay => "delay",
            FaultKind::FailureRate => "failure_rate",
            FaultKind::Crash => "crash",
            FaultKind::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

/// A fault plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultSpec {
    Delay { delay_ms: u64 },
    FailureRate { rate: f64 },
    Crash { probability: f64 },
    ResourceExhaustion { resource: String, level: f64 },
}

impl FaultSpec {
    pub fn kind(&self) -> FaultKind {
        match self {
            FaultSpec::Delay { .. } => FaultKind::Delay,
            FaultSpec::FailureRate { .. } => FaultKind::FailureRate,
            FaultSpec::Crash { .. } => FaultKind::Crash,
            FaultSpec::ResourceExhaustion { .. } => FaultKind::ResourceExhaustion,
        }
    }

    /// Normalized severity in `[0, 1]`. A five-second delay counts as
    /// maximal.
    pub fn intensity(&self) -> f64 {
        match self {
            FaultSpec::Delay { delay_ms } => (*delay_ms as f64 / 5_000.0).min(1.0),
            FaultSpec::FailureRate { rate } => rate.clamp(0.0, 1.0),
            FaultSpec::Crash { probability } => probability.clamp(0.0, 1.0),
            FaultSpec::ResourceExhaustion { level, .. } => level.clamp(0.0, 1.0),
        }
    }

    fn key_suffix(&self) -> String {
        match self {
            FaultSpec::Delay { .. } => "delay".to_string(),
            FaultSpec::FailureRate { .. } => "failure".to_string(),
            FaultSpec::Crash { .. } => "crash".to_string(),
            FaultSpec::ResourceExhaustion { resource, .. } => format!("resource:{}", resource),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosExperiment {
    pub id: String,
    pub target_service: String,
    pub fault: FaultSpec,
    pub intensity: f64,
    pub duration_secs: u64,
    pub status: ExperimentStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
}

/// Store record the execution path reads on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveFault {
    pub experiment_id: String,
    pub service: String,
    pub fault: FaultSpec,
    pub injected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Multi-service failure drills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Latency plus packet-loss-like failures on every service at once
    NetworkStorm,
    /// Primary crashes hard; downstream services degrade after a stagger
    CascadingFailure,
    /// Memory pressure on the two busiest services
    ResourceCrunch,
    /// Every call to every service fails
    TotalBlackout,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 4] = [
        ScenarioKind::NetworkStorm,
        ScenarioKind::CascadingFailure,
        ScenarioKind::ResourceCrunch,
        ScenarioKind::TotalBlackout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioKind::NetworkStorm => "network_storm",
            ScenarioKind::CascadingFailure => "cascading_failure",
            ScenarioKind::ResourceCrunch => "resource_crunch",
            ScenarioKind::TotalBlackout => "total_blackout",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = ResilienceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "network_storm" => Ok(ScenarioKind::NetworkStorm),
            "cascading_failure" => Ok(ScenarioKind::CascadingFailure),
            "resource_crunch" => Ok(ScenarioKind::ResourceCrunch),
            "total_blackout" => Ok(ScenarioKind::TotalBlackout),
            other => Err(ResilienceError::Config(format!(
                "unknown chaos scenario '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,
    pub experiment_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChaosStatus {
    pub enabled: bool,
    pub active_experiments: Vec<ChaosExperiment>,
    pub total_experiments: usize,
    pub available_scenarios: Vec<&'static str>,
}

fn fault_key(service: &str, fault: &FaultSpec) -> String {
    format!("chaos:{}:{}", service, fault.key_suffix())
}

fn experiment_id(kind: FaultKind) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("{}_{}_{}", kind.as_str(), Utc::now().timestamp(), suffix)
}

#[derive(Clone)]
pub struct ChaosEngine {
    store: Arc<dyn DurableStore>,
    enabled: Arc<AtomicBool>,
    experiments: Arc<RwLock<HashMap<String, ChaosExperiment>>>,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    scenario_stagger: Duration,
}

impl ChaosEngine {
    pub fn new(store: Arc<dyn DurableStore>, enabled: bool) -> Self {
        Self {
            store,
            enabled: Arc::new(AtomicBool::new(enabled)),
            experiments: Arc::new(RwLock::new(HashMap::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
            scenario_stagger: DEFAULT_SCENARIO_STAGGER,
        }
    }

    /// Delay between a scenario's primary and downstream injections.
    pub fn with_scenario_stagger(mut self, stagger: Duration) -> Self {
        self.scenario_stagger = stagger;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the master switch. Disabling leaves extant fault records to age
    /// out via TTL, but the overlay stops reading them immediately.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            warn!("Chaos engineering enabled");
        } else {
            info!("Chaos engineering disabled");
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(ResilienceError::ChaosDisabled)
        }
    }

    pub async fn inject_delay(
        &self,
        service: &str,
        delay: Duration,
        duration: Duration,
    ) -> Result<String> {
        self.inject(
            service,
            FaultSpec::Delay {
                delay_ms: delay.as_millis() as u64,
            },
            duration,
        )
        .await
    }

    pub async fn inject_failure_rate(
        &self,
        service: &str,
        rate: f64,
        duration: Duration,
    ) -> Result<String> {
        self.inject(
            service,
            FaultSpec::FailureRate {
                rate: rate.clamp(0.0, 1.0),
            },
            duration,
        )
        .await
    }

    pub async fn inject_crash(
        &self,
        service: &str,
        probability: f64,
        duration: Duration,
    ) -> Result<String> {
        self.inject(
            service,
            FaultSpec::Crash {
                probability: probability.clamp(0.0, 1.0),
            },
            duration,
        )
        .await
    }

    pub async fn inject_resource_exhaustion(
        &self,
        service: &str,
        resource: &str,
        level: f64,
        duration: Duration,
    ) -> Result<String> {
        self.inject(
            service,
            FaultSpec::ResourceExhaustion {
                resource: resource.to_string(),
                level: level.clamp(0.0, 1.0),
            },
            duration,
        )
        .await
    }

    async fn inject(&self, service: &str, fault: FaultSpec, duration: Duration) -> Result<String> {
        self.ensure_enabled()?;

        let id = experiment_id(fault.kind());
        let now = Utc::now();
        let active_until = now
            + chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(3_600));

        let record = ActiveFault {
            experiment_id: id.clone(),
            service: service.to_string(),
            fault: fault.clone(),
            injected_at: now,
            expires_at: active_until,
        };
        let key = fault_key(service, &fault);
        self.store
            .set_ex(&key, &serde_json::to_string(&record)?, duration + FAULT_TTL_GRACE)
            .await?;

        let experiment = ChaosExperiment {
            id: id.clone(),
            target_service: service.to_string(),
            intensity: fault.intensity(),
            fault,
            duration_secs: duration.as_secs(),
            status: ExperimentStatus::Running,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            results: None,
        };
        warn!(
            service = %service,
            experiment_id = %id,
            fault = experiment.fault.kind().as_str(),
            intensity = experiment.intensity,
            duration_secs = experiment.duration_secs,
            "Chaos fault injected"
        );
        self.experiments.write().insert(id.clone(), experiment);
        self.spawn_completion_timer(id.clone(), key, duration);

        Ok(id)
    }

    fn spawn_completion_timer(&self, id: String, fault_key: String, duration: Duration) {
        let experiments = self.experiments.clone();
        let timers = self.timers.clone();
        let store = self.store.clone();
        let timer_id = id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            // Only clear the record if it still belongs to this experiment;
            // a later injection of the same fault kind replaces the key.
            match store.get(&fault_key).await {
                Ok(Some(json)) => {
                    let owned = serde_json::from_str::<ActiveFault>(&json)
                        .map(|f| f.experiment_id == timer_id)
                        .unwrap_or(true);
                    if owned {
                        if let Err(err) = store.del(&fault_key).await {
                            // TTL will reap it regardless
                            warn!(
                                experiment_id = %timer_id,
                                error = %err,
                                "Failed to clear fault record"
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(
                    experiment_id = %timer_id,
                    error = %err,
                    "Failed to read fault record during cleanup"
                ),
            }

            if let Some(experiment) = experiments.write().get_mut(&timer_id) {
                experiment.status = ExperimentStatus::Completed;
                experiment.completed_at = Some(Utc::now());
                experiment.results =
                    Some(serde_json::json!({ "ran_full_duration": true }));
            }
            timers.lock().remove(&timer_id);
            info!(experiment_id = %timer_id, "Chaos experiment completed");
        });

        self.timers.lock().insert(id, handle);
    }

    /// Stop a running experiment early. Returns false for unknown or
    /// already-finished experiments.
    pub async fn stop_experiment(&self, id: &str) -> Result<bool> {
        let experiment = {
            let experiments = self.experiments.read();
            experiments.get(id).cloned()
        };
        let Some(experiment) = experiment else {
            return Ok(false);
        };
        if !matches!(
            experiment.status,
            ExperimentStatus::Running | ExperimentStatus::Pending
        ) {
            return Ok(false);
        }

        if let Some(handle) = self.timers.lock().remove(id) {
            handle.abort();
        }
        self.store
            .del(&fault_key(&experiment.target_service, &experiment.fault))
            .await?;

        if let Some(entry) = self.experiments.write().get_mut(id) {
            entry.status = ExperimentStatus::Completed;
            entry.completed_at = Some(Utc::now());
            entry.results = Some(serde_json::json!({ "stopped_early": true }));
        }

        info!(experiment_id = %id, "Chaos experiment stopped");
        Ok(true)
    }

    /// Halt every running experiment and sweep any orphaned fault records,
    /// including ones left behind by a previous process. Safe to call twice;
    /// the second call finds nothing.
    pub async fn emergency_stop_all(&self) -> Result<u64> {
        let running: Vec<String> = self
            .experiments
            .read()
            .iter()
            .filter(|(_, e)| matches!(e.status, ExperimentStatus::Running))
            .map(|(id, _)| id.clone())
            .collect();

        let outcomes = join_all(running.iter().map(|id| self.stop_experiment(id))).await;
        let stopped = outcomes
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(true)))
            .count() as u64;

        for key in self.store.keys("chaos:*").await? {
            self.store.del(&key).await?;
        }

        if stopped > 0 {
            warn!(stopped, "Emergency stop: all chaos experiments halted");
        }
        Ok(stopped)
    }

    /// The fault currently aimed at a service, if chaos is enabled.
    pub async fn active_fault(&self, service: &str) -> Result<Option<ActiveFault>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        for key in self.store.keys(&format!("chaos:{}:*", service)).await? {
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<ActiveFault>(&json) {
                Ok(fault) => {
                    // The TTL carries a grace margin, so double-check the
                    // logical expiry
                    if fault.expires_at > Utc::now() {
                        return Ok(Some(fault));
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Dropping unreadable fault record");
                    self.store.del(&key).await?;
                }
            }
        }
        Ok(None)
    }

    /// Apply the active fault, if any, to a call about to run: delays and
    /// resource pressure add latency, failure and crash faults inject an
    /// error with their configured probability.
    pub async fn overlay(&self, service: &str) -> Result<()> {
        let Some(fault) = self.active_fault(service).await? else {
            return Ok(());
        };

        match &fault.fault {
            FaultSpec::Delay { delay_ms } => {
                debug!(service = %service, delay_ms, "Chaos delay applied");
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                Ok(())
            }
            FaultSpec::FailureRate { rate } => {
                if rand::thread_rng().gen::<f64>() < *rate {
                    Err(ResilienceError::ChaosInjected {
                        service: service.to_string(),
                        fault: FaultKind::FailureRate.as_str().to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            FaultSpec::Crash { probability } => {
                if rand::thread_rng().gen::<f64>() < *probability {
                    Err(ResilienceError::ChaosInjected {
                        service: service.to_string(),
                        fault: FaultKind::Crash.as_str().to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            FaultSpec::ResourceExhaustion { level, resource } => {
                // Starvation shows up as latency proportional to pressure
                let throttle = Duration::from_millis((level.clamp(0.0, 1.0) * 1_000.0) as u64);
                debug!(
                    service = %service,
                    resource = %resource,
                    throttle_ms = throttle.as_millis() as u64,
                    "Chaos resource pressure applied"
                );
                tokio::time::sleep(throttle).await;
                Ok(())
            }
        }
    }

    /// Launch a multi-service drill against the given targets.
    pub async fn run_scenario(
        &self,
        scenario: ScenarioKind,
        services: &[String],
    ) -> Result<ScenarioReport> {
        self.ensure_enabled()?;
        if services.is_empty() {
            return Err(ResilienceError::Config(
                "chaos scenario needs at least one target service".to_string(),
            ));
        }

        let started_at = Utc::now();
        let mut experiment_ids = Vec::new();

        match scenario {
            ScenarioKind::NetworkStorm => {
                for service in services {
                    let delay_ms: u64 = rand::thread_rng().gen_range(100..=2_000);
                    experiment_ids.push(
                        self.inject_delay(
                            service,
                            Duration::from_millis(delay_ms),
                            STORM_DELAY_TTL,
                        )
                        .await?,
                    );
                    let rate: f64 = rand::thread_rng().gen_range(0.05..=0.20);
                    experiment_ids.push(
                        self.inject_failure_rate(service, rate, STORM_FAILURE_TTL)
                            .await?,
                    );
                }
            }
            ScenarioKind::CascadingFailure => {
                experiment_ids.push(
                    self.inject_crash(&services[0], 0.8, CASCADE_CRASH_TTL)
                        .await?,
                );
                tokio::time::sleep(self.scenario_stagger).await;
                for service in services.iter().skip(1).take(2) {
                    experiment_ids.push(
                        self.inject_failure_rate(service, 0.5, CASCADE_DOWNSTREAM_TTL)
                            .await?,
                    );
                }
            }
            ScenarioKind::ResourceCrunch => {
                for service in services.iter().take(2) {
                    experiment_ids.push(
                        self.inject_resource_exhaustion(service, "memory", 0.7, CRUNCH_TTL)
                            .await?,
                    );
                }
            }
            ScenarioKind::TotalBlackout => {
                for service in services {
                    experiment_ids.push(
                        self.inject_failure_rate(service, 1.0, BLACKOUT_TTL).await?,
                    );
                }
            }
        }

        warn!(
            scenario = %scenario,
            experiments = experiment_ids.len(),
            "Chaos scenario launched"
        );
        Ok(ScenarioReport {
            scenario,
            experiment_ids,
            started_at,
        })
    }

    pub fn experiment(&self, id: &str) -> Option<ChaosExperiment> {
        self.experiments.read().get(id).cloned()
    }

    pub fn status(&self) -> ChaosStatus {
        let experiments = self.experiments.read();
        let active: Vec<ChaosExperiment> = experiments
            .values()
            .filter(|e| matches!(e.status, ExperimentStatus::Running))
            .cloned()
            .collect();
        ChaosStatus {
            enabled: self.is_enabled(),
            total_experiments: experiments.len(),
            active_experiments: active,
            available_scenarios: ScenarioKind::ALL.iter().map(|s| s.as_str()).collect(),
        }
    }
}
