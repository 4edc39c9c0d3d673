//! Background replay of queued operations.
//!
//! One loop serves all three queues. Each pass promotes due delayed items,
//! sweeps expired claims back to pending, then pops up to a batch of items
//! per queue and replays them through the same health/chaos/breaker gauntlet
//! as live traffic. Items aimed at a service that is still down are deferred
//! without touching their retry budget; only real dispatch failures burn it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{OperationError, ResilienceError, Result};
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::queue::{FailOutcome, QueueItem, RetryQueue};

/// Maps a queued item back onto the real downstream call.
///
/// Return an [`OperationError`] inside the `anyhow` chain to control
/// classification; anything else is treated as transient.
#[async_trait]
pub trait RetryDispatcher: Send + Sync {
    async fn dispatch(&self, item: &QueueItem) -> anyhow::Result<serde_json::Value>;
}

/// Owns the scheduler task. Dropping the handle aborts the loop; call
/// [`shutdown`](Self::shutdown) to let the current pass finish first.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub(crate) fn spawn(
    orchestrator: Orchestrator,
    dispatcher: Arc<dyn RetryDispatcher>,
) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let config = orchestrator.config().scheduler.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_secs = config.poll_interval.as_secs(),
            batch_size = config.batch_size,
            "Retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Retry scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = run_pass(&orchestrator, dispatcher.as_ref(), &config).await {
                        warn!(
                            error = %err,
                            backoff_secs = config.error_backoff.as_secs(),
                            "Retry pass failed; backing off"
                        );
                        tokio::time::sleep(config.error_backoff).await;
                    }
                }
            }
        }
    });

    SchedulerHandle {
        shutdown_tx,
        handle: Some(handle),
    }
}

async fn run_pass(
    orchestrator: &Orchestrator,
    dispatcher: &dyn RetryDispatcher,
    config: &SchedulerConfig,
) -> Result<()> {
    for queue in orchestrator.queues().all() {
        let promoted = queue.promote_due().await?;
        let recovered = queue.recover_expired().await?;
        if promoted > 0 || recovered > 0 {
            debug!(
                queue = queue.name(),
                promoted, recovered, "Queue maintenance finished"
            );
        }

        for _ in 0..config.batch_size {
            let Some(item) = queue.pop().await? else {
                break;
            };
            process_item(orchestrator, dispatcher, config, queue, item).await?;
        }
    }
    Ok(())
}

async fn process_item(
    orchestrator: &Orchestrator,
    dispatcher: &dyn RetryDispatcher,
    config: &SchedulerConfig,
    queue: &RetryQueue,
    item: QueueItem,
) -> Result<()> {
    let service = item.service.clone();
    orchestrator.health().ensure_service(&service);

    if !orchestrator.health().is_healthy(&service) {
        debug!(
            item_id = %item.id,
            service = %service,
            defer_secs = config.unhealthy_defer.as_secs(),
            "Target service still unhealthy; deferring"
        );
        queue.defer(&item, config.unhealthy_defer).await?;
        return Ok(());
    }

    let outcome = match orchestrator.chaos().overlay(&service).await {
        Ok(()) => {
            orchestrator
                .breakers()
                .breaker_for(&service)
                .call(|| async {
                    dispatcher
                        .dispatch(&item)
                        .await
                        .map_err(|err| match err.downcast::<OperationError>() {
                            Ok(operation_err) => operation_err,
                            Err(other) => OperationError::from(other),
                        })
                })
                .await
        }
        Err(err) => Err(err),
    };

    match outcome {
        Ok(_) => {
            info!(item_id = %item.id, service = %service, "Queued operation replayed");
            queue.complete(&item.id).await?;
            metrics::record_operation(&service, item.operation.as_str(), "replayed");
        }
        Err(ResilienceError::Execution(ref operation_err)) if !operation_err.is_transient() => {
            warn!(
                item_id = %item.id,
                service = %service,
                error = %operation_err,
                "Queued operation failed permanently; dead-lettering"
            );
            queue.dead_letter(&item, &operation_err.to_string()).await?;
        }
        Err(err) => match queue.fail(&item, &err.to_string()).await? {
            FailOutcome::Rescheduled {
                retry_count,
                next_retry_at,
            } => {
                debug!(
                    item_id = %item.id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    "Replay failed; rescheduled"
                );
            }
            FailOutcome::DeadLettered => {
                warn!(
                    item_id = %item.id,
                    service = %service,
                    "Retry budget exhausted; item dead-lettered"
                );
            }
        },
    }
    Ok(())
}
