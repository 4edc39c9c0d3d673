//! Continuous service health monitoring.
//!
//! Each registered service gets its own probe loop. Probes are either an
//! HTTP GET checked against a status allowlist or a caller-supplied
//! [`ServiceProbe`]. Loops record outcomes into a shared registry, persist a
//! snapshot every tenth check so restarts keep history, and never die on
//! probe or store errors.
//!
//! Health is advisory and optimistic: a service is healthy until a probe
//! says otherwise, and asking about an unknown service does not block
//! anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::presets::ServiceProfile;
use crate::store::DurableStore;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EXPECTED_STATUSES: [u16; 3] = [200, 201, 202];
/// Snapshot cadence: persist after every Nth check.
const PERSIST_EVERY: u64 = 10;

/// Rolling health record for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_checks: u64,
    pub total_failures: u64,
    /// Running mean probe latency in seconds
    pub avg_response_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ServiceHealth {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            is_healthy: true,
            last_check: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            total_checks: 0,
            total_failures: 0,
            avg_response_time: 0.0,
            last_error: None,
        }
    }

    pub fn record_check(&mut self, success: bool, response_time: Duration, error: Option<String>) {
        let now = Utc::now();
        self.last_check = Some(now);
        self.total_checks += 1;

        let secs = response_time.as_secs_f64();
        self.avg_response_time += (secs - self.avg_response_time) / self.total_checks as f64;

        if success {
            self.last_success = Some(now);
            self.consecutive_failures = 0;
            self.is_healthy = true;
            self.last_error = None;
        } else {
            self.last_failure = Some(now);
            self.total_failures += 1;
            self.consecutive_failures += 1;
            self.is_healthy = false;
            self.last_error = error;
        }
    }

    /// Share of checks that succeeded, as a percentage. 100 until the first
    /// check lands.
    pub fn uptime_percentage(&self) -> f64 {
        if self.total_checks == 0 {
            return 100.0;
        }
        (self.total_checks - self.total_failures) as f64 / self.total_checks as f64 * 100.0
    }
}

/// A single health probe attempt.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn probe(&self) -> anyhow::Result<()>;
}

/// GET a URL and accept any status on the allowlist.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    expected_statuses: Vec<u16>,
    timeout: Duration,
    headers: Vec<(String, String)>,
}

#[async_trait]
impl ServiceProbe for HttpProbe {
    async fn probe(&self) -> anyhow::Result<()> {
        let mut request = self.client.get(&self.url).timeout(self.timeout);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                anyhow::anyhow!("probe timed out after {:?}", self.timeout)
            } else if err.is_connect() {
                anyhow::anyhow!("connection failed: {}", err)
            } else {
                anyhow::anyhow!("request failed: {}", err)
            }
        })?;

        let status = response.status().as_u16();
        if self.expected_statuses.contains(&status) {
            Ok(())
        } else {
            anyhow::bail!("unexpected status {}", status)
        }
    }
}

#[derive(Clone)]
enum ProbeSpec {
    Http {
        url: String,
        expected_statuses: Vec<u16>,
        headers: Vec<(String, String)>,
    },
    Custom(Arc<dyn ServiceProbe>),
}

/// How one service is probed.
#[derive(Clone)]
pub struct ServiceCheckConfig {
    pub name: String,
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    probe: ProbeSpec,
}

impl ServiceCheckConfig {
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe: ProbeSpec::Http {
                url: url.into(),
                expected_statuses: DEFAULT_EXPECTED_STATUSES.to_vec(),
                headers: Vec::new(),
            },
        }
    }

    pub fn custom(name: impl Into<String>, probe: Arc<dyn ServiceProbe>) -> Self {
        Self {
            name: name.into(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe: ProbeSpec::Custom(probe),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Probe cadence from a preset profile.
    pub fn with_profile(mut self, profile: &ServiceProfile) -> Self {
        self.check_interval = profile.check_interval;
        self.probe_timeout = profile.probe_timeout;
        self
    }

    /// Replace the accepted HTTP statuses. No effect on custom probes.
    pub fn with_expected_statuses(mut self, statuses: Vec<u16>) -> Self {
        if let ProbeSpec::Http {
            expected_statuses, ..
        } = &mut self.probe
        {
            *expected_statuses = statuses;
        }
        self
    }

    /// Add a static header to HTTP probes, e.g. an auth token.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let ProbeSpec::Http { headers, .. } = &mut self.probe {
            headers.push((name.into(), value.into()));
        }
        self
    }

    fn build_probe(&self, client: &reqwest::Client) -> Arc<dyn ServiceProbe> {
        match &self.probe {
            ProbeSpec::Http {
                url,
                expected_statuses,
                headers,
            } => Arc::new(HttpProbe {
                client: client.clone(),
                url: url.clone(),
                expected_statuses: expected_statuses.clone(),
                timeout: self.probe_timeout,
                headers: headers.clone(),
            }),
            ProbeSpec::Custom(probe) => probe.clone(),
        }
    }
}

/// System-wide rollup for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub health_percentage: f64,
    pub average_uptime: f64,
    /// Up to five services with the longest active failure streaks
    pub most_failing: Vec<FailingService>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailingService {
    pub service: String,
    pub consecutive_failures: u32,
}

#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<dyn DurableStore>,
    client: reqwest::Client,
    statuses: Arc<RwLock<HashMap<String, ServiceHealth>>>,
    configs: Arc<RwLock<HashMap<String, ServiceCheckConfig>>>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    started: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            configs: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register (or replace) a service check. Takes effect immediately if
    /// monitoring is already running.
    pub fn register_service(&self, config: ServiceCheckConfig) {
        let name = config.name.clone();
        self.statuses
            .write()
            .entry(name.clone())
            .or_insert_with(|| ServiceHealth::new(name.clone()));
        self.configs.write().insert(name.clone(), config.clone());

        if self.started.load(Ordering::SeqCst) {
            self.spawn_probe_loop(config);
        }
        debug!(service = %name, "Health check registered");
    }

    /// Track a service without probing it. Its record stays optimistic
    /// until something registers a real check.
    pub fn ensure_service(&self, service: &str) {
        self.statuses
            .write()
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealth::new(service));
    }

    /// Start one probe loop per registered service, rehydrating persisted
    /// snapshots first. Idempotent.
    pub async fn start_monitoring(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.rehydrate_snapshots().await;

        let configs: Vec<ServiceCheckConfig> = self.configs.read().values().cloned().collect();
        let count = configs.len();
        for config in configs {
            self.spawn_probe_loop(config);
        }
        info!(services = count, "Health monitoring started");
    }

    /// Abort every probe loop. Idempotent.
    pub fn stop_monitoring(&self) {
        self.started.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        info!("Health monitoring stopped");
    }

    pub fn is_healthy(&self, service: &str) -> bool {
        self.statuses
            .read()
            .get(service)
            .map(|status| status.is_healthy)
            .unwrap_or(true)
    }

    pub fn health(&self, service: &str) -> Option<ServiceHealth> {
        self.statuses.read().get(service).cloned()
    }

    pub fn all_health(&self) -> HashMap<String, ServiceHealth> {
        self.statuses.read().clone()
    }

    pub fn summary(&self) -> HealthSummary {
        let statuses = self.statuses.read();
        let total = statuses.len();
        let healthy = statuses.values().filter(|s| s.is_healthy).count();

        let average_uptime = if total == 0 {
            100.0
        } else {
            statuses.values().map(|s| s.uptime_percentage()).sum::<f64>() / total as f64
        };
        let health_percentage = if total == 0 {
            100.0
        } else {
            healthy as f64 / total as f64 * 100.0
        };

        let mut most_failing: Vec<FailingService> = statuses
            .values()
            .filter(|s| s.consecutive_failures > 0)
            .map(|s| FailingService {
                service: s.service_name.clone(),
                consecutive_failures: s.consecutive_failures,
            })
            .collect();
        most_failing.sort_by(|a, b| b.consecutive_failures.cmp(&a.consecutive_failures));
        most_failing.truncate(5);

        HealthSummary {
            total_services: total,
            healthy_services: healthy,
            unhealthy_services: total - healthy,
            health_percentage,
            average_uptime,
            most_failing,
            generated_at: Utc::now(),
        }
    }

    async fn rehydrate_snapshots(&self) {
        let keys = match self.store.keys("health:*").await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Failed to list persisted health snapshots");
                return;
            }
        };

        for key in keys {
            let Ok(Some(json)) = self.store.get(&key).await else {
                continue;
            };
            match serde_json::from_str::<ServiceHealth>(&json) {
                Ok(snapshot) => {
                    self.statuses
                        .write()
                        .insert(snapshot.service_name.clone(), snapshot);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Discarding unreadable health snapshot")
                }
            }
        }
    }

    fn spawn_probe_loop(&self, config: ServiceCheckConfig) {
        let service = config.name.clone();
        let probe = config.build_probe(&self.client);
        let statuses = self.statuses.clone();
        let store = self.store.clone();
        let interval = config.check_interval;
        let timeout = config.probe_timeout;

        let task_service = service.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, probe.probe()).await;
                let elapsed = started.elapsed();

                let (success, error) = match outcome {
                    Ok(Ok(())) => (true, None),
                    Ok(Err(err)) => (false, Some(format!("{:#}", err))),
                    Err(_) => (false, Some(format!("probe timed out after {:?}", timeout))),
                };

                let snapshot = {
                    let mut statuses = statuses.write();
                    let status = statuses
                        .entry(task_service.clone())
                        .or_insert_with(|| ServiceHealth::new(task_service.clone()));
                    let was_healthy = status.is_healthy;
                    status.record_check(success, elapsed, error.clone());

                    if was_healthy && !status.is_healthy {
                        warn!(
                            service = %task_service,
                            error = error.as_deref().unwrap_or("unknown"),
                            "Service became unhealthy"
                        );
                    } else if !was_healthy && status.is_healthy {
                        info!(service = %task_service, "Service recovered");
                    } else if !success {
                        debug!(
                            service = %task_service,
                            consecutive_failures = status.consecutive_failures,
                            "Health check failed"
                        );
                    }
                    status.clone()
                };

                metrics::record_health_check(&task_service, success);

                // Persistence trouble must not kill the loop
                if snapshot.total_checks % PERSIST_EVERY == 0 {
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => {
                            let key = format!("health:{}", task_service);
                            if let Err(err) = store.set(&key, &json).await {
                                warn!(
                                    service = %task_service,
                                    error = %err,
                                    "Failed to persist health snapshot"
                                );
                            }
                        }
                        Err(err) => warn!(
                            service = %task_service,
                            error = %err,
                            "Failed to serialize health snapshot"
                        ),
                    }
                }
            }
        });

        if let Some(previous) = self.tasks.lock().insert(service, handle) {
            previous.abort();
        }
    }
}
