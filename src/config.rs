use std::env;
use std::time::Duration;

use rand::Rng;

use crate::error::{ResilienceError, Result};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_BASE_DELAY_SECS: u64 = 300;
const DEFAULT_MAX_DELAY_SECS: u64 = 86_400;
const DEFAULT_JITTER: f64 = 0.25;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 3_600;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_ERROR_BACKOFF_SECS: u64 = 60;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_UNHEALTHY_DEFER_SECS: u64 = 600;

/// Backoff policy for failed queue items.
///
/// The delay for attempt `n` is `base_delay * 2^n` with symmetric jitter
/// applied so synchronized failures do not retry in lockstep; `max_delay`
/// bounds the final value, jitter included.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts an item is allowed; reaching this count dead-letters it
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1)`; 0.25 means +/-25%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt given how many retries already ran.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // powi saturates to infinity well past any practical retry count
        let exponential =
            self.base_delay.as_secs_f64() * 2f64.powi(retry_count.min(32) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };

        // max_delay is a hard ceiling even after jitter
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

/// Cadence and sizing for the background retry scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler drains due items
    pub poll_interval: Duration,
    /// Pause after a cycle that failed on store errors
    pub error_backoff: Duration,
    /// Items popped per queue per cycle
    pub batch_size: usize,
    /// Reschedule horizon for items whose service is still unhealthy
    pub unhealthy_defer: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            error_backoff: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            unhealthy_defer: Duration::from_secs(DEFAULT_UNHEALTHY_DEFER_SECS),
        }
    }
}

/// Top-level configuration for the resilience layer.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub redis_url: String,
    /// Master switch for chaos injection; off unless explicitly enabled
    pub chaos_enabled: bool,
    /// How long a popped item may stay in-flight before the sweep reclaims it
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            chaos_enabled: false,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let jitter = match env::var("RESILIENCE_RETRY_JITTER") {
            Ok(raw) => {
                let parsed: f64 = raw.parse().map_err(|_| {
                    ResilienceError::Config(format!(
                        "RESILIENCE_RETRY_JITTER must be a float, got '{}'",
                        raw
                    ))
                })?;
                if !(0.0..1.0).contains(&parsed) {
                    return Err(ResilienceError::Config(format!(
                        "RESILIENCE_RETRY_JITTER must be in [0, 1), got {}",
                        parsed
                    )));
                }
                parsed
            }
            Err(_) => DEFAULT_JITTER,
        };

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            chaos_enabled: env::var("CHAOS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            visibility_timeout: Duration::from_secs(
                env_u64("RESILIENCE_VISIBILITY_TIMEOUT_SECS", DEFAULT_VISIBILITY_TIMEOUT_SECS),
            ),
            retry: RetryPolicy {
                max_retries: env::var("RESILIENCE_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_RETRIES),
                base_delay: Duration::from_secs(env_u64(
                    "RESILIENCE_RETRY_BASE_SECS",
                    DEFAULT_BASE_DELAY_SECS,
                )),
                max_delay: Duration::from_secs(env_u64(
                    "RESILIENCE_RETRY_MAX_SECS",
                    DEFAULT_MAX_DELAY_SECS,
                )),
                jitter,
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_secs(env_u64(
                    "RESILIENCE_POLL_INTERVAL_SECS",
                    DEFAULT_POLL_INTERVAL_SECS,
                )),
                error_backoff: Duration::from_secs(env_u64(
                    "RESILIENCE_ERROR_BACKOFF_SECS",
                    DEFAULT_ERROR_BACKOFF_SECS,
                )),
                batch_size: env::var("RESILIENCE_BATCH_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_SIZE),
                unhealthy_defer: Duration::from_secs(env_u64(
                    "RESILIENCE_UNHEALTHY_DEFER_SECS",
                    DEFAULT_UNHEALTHY_DEFER_SECS,
                )),
            },
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            redis_url: "redis://localhost:6379/15".to_string(),
            chaos_enabled: true,
            visibility_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter: 0.0,
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(20),
                error_backoff: Duration::from_millis(20),
                batch_size: 5,
                unhealthy_defer: Duration::from_millis(50),
            },
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
