//! Durable retry queues.
//!
//! Failed operations are parked here and retried with exponential backoff.
//! Each queue keeps three sorted sets in the store plus per-item records:
//!
//! - `queue:{name}:pending`     items ready to pop, scored so higher
//!   priority pops first and arrival order breaks ties
//! - `queue:{name}:delayed`     items waiting out a backoff, scored by due time
//! - `queue:{name}:processing`  in-flight claims scored by visibility deadline,
//!   with the payload under `queue:{name}:processing:{id}`
//! - `queue:{name}:dead:{id}`   exhausted items, kept seven days
//! - `queue:{name}:completed:{id}`  completion markers, kept one day
//!
//! Delivery is at-least-once: a consumer that dies mid-item loses its claim
//! when the visibility deadline passes and the sweep returns the item to
//! pending. Consumers must tolerate duplicates; nothing is ever silently
//! dropped.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::error::{ResilienceError, Result};
use crate::metrics;
use crate::store::DurableStore;

/// Priority bands; higher pops first regardless of age.
const PRIORITY_STRIDE: f64 = 1e13;
/// Items moved from delayed to pending per sweep.
const PROMOTE_BATCH: usize = 100;

const COMPLETED_TTL: Duration = Duration::from_secs(86_400);
const DEAD_LETTER_TTL: Duration = Duration::from_secs(604_800);

/// Item priority. Critical work (order capture) must drain before read-only
/// backfill no matter how long the backfill has been waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(format!("invalid priority {}", other)),
        }
    }
}

/// The operations this layer knows how to park and replay.
///
/// Keeping this closed means priorities and queue routing live in one table
/// instead of being scattered through call sites as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateOrder,
    UpdateOrder,
    CancelOrder,
    ListOrders,
    UpdateInventory,
    CreateFulfillment,
    ListFulfillments,
    SendSms,
    SendEmail,
}

impl OperationKind {
    pub fn priority(self) -> Priority {
        match self {
            OperationKind::CreateOrder => Priority::Critical,
            OperationKind::UpdateInventory | OperationKind::CreateFulfillment => Priority::High,
            OperationKind::UpdateOrder
            | OperationKind::CancelOrder
            | OperationKind::SendSms
            | OperationKind::SendEmail => Priority::Medium,
            OperationKind::ListOrders | OperationKind::ListFulfillments => Priority::Low,
        }
    }

    pub fn queue_class(self) -> QueueClass {
        match self {
            OperationKind::CreateOrder
            | OperationKind::UpdateOrder
            | OperationKind::CancelOrder
            | OperationKind::ListOrders
            | OperationKind::UpdateInventory => QueueClass::Orders,
            OperationKind::CreateFulfillment | OperationKind::ListFulfillments => {
                QueueClass::Fulfillments
            }
            OperationKind::SendSms | OperationKind::SendEmail => QueueClass::Notifications,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateOrder => "create_order",
            OperationKind::UpdateOrder => "update_order",
            OperationKind::CancelOrder => "cancel_order",
            OperationKind::ListOrders => "list_orders",
            OperationKind::UpdateInventory => "update_inventory",
            OperationKind::CreateFulfillment => "create_fulfillment",
            OperationKind::ListFulfillments => "list_fulfillments",
            OperationKind::SendSms => "send_sms",
            OperationKind::SendEmail => "send_email",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ResilienceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create_order" => Ok(OperationKind::CreateOrder),
            "update_order" => Ok(OperationKind::UpdateOrder),
            "cancel_order" => Ok(OperationKind::CancelOrder),
            "list_orders" => Ok(OperationKind::ListOrders),
            "update_inventory" => Ok(OperationKind::UpdateInventory),
            "create_fulfillment" => Ok(OperationKind::CreateFulfillment),
            "list_fulfillments" => Ok(OperationKind::ListFulfillments),
            "send_sms" => Ok(OperationKind::SendSms),
            "send_email" => Ok(OperationKind::SendEmail),
            other => Err(ResilienceError::Config(format!(
                "unknown operation '{}'",
                other
            ))),
        }
    }
}

/// Which physical queue an operation lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Orders,
    Fulfillments,
    Notifications,
}

impl QueueClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueClass::Orders => "orders",
            QueueClass::Fulfillments => "fulfillments",
            QueueClass::Notifications => "notifications",
        }
    }
}

/// A parked operation waiting for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub operation: OperationKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(
        operation: OperationKind,
        service: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        let id = format!(
            "{}_{}_{}",
            operation,
            now.timestamp_millis(),
            content_hash(&payload.to_string())
        );
        Self {
            id,
            operation,
            priority: operation.priority(),
            payload,
            retry_count: 0,
            max_retries: 10,
            created_at: now,
            next_retry_at: now,
            service: service.into(),
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// What [`RetryQueue::fail`] did with the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Rescheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered,
}

/// Counts across one queue's buckets; `pending` includes delayed items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub completed: u64,
}

fn content_hash(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish() % 10_000
}

/// Pending score: priority band dominates, enqueue time orders within a band
/// (millisecond granularity). Bands are wide enough that timestamps can
/// never cross them, and the largest score stays well inside f64's exact
/// integer range.
fn pending_score(priority: Priority, enqueued_at: DateTime<Utc>) -> f64 {
    (4 - priority.as_u8()) as f64 * PRIORITY_STRIDE + enqueued_at.timestamp_millis() as f64
}

#[derive(Clone)]
pub struct RetryQueue {
    name: String,
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl RetryQueue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn DurableStore>,
        policy: RetryPolicy,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            policy,
            visibility_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.name, suffix)
    }

    fn claim_key(&self, id: &str) -> String {
        self.key(&format!("processing:{}", id))
    }

    fn dead_key(&self, id: &str) -> String {
        self.key(&format!("dead:{}", id))
    }

    fn completed_key(&self, id: &str) -> String {
        self.key(&format!("completed:{}", id))
    }

    /// Enqueue an item. Items whose `next_retry_at` is in the future land in
    /// the delayed bucket and surface via [`promote_due`](Self::promote_due).
    ///
    /// Refuses items whose retry budget is already spent; those belong in
    /// the dead-letter bucket, not back in rotation.
    pub async fn push(&self, item: &QueueItem) -> Result<String> {
        if item.retry_count >= item.max_retries {
            return Err(ResilienceError::QueueExhausted {
                id: item.id.clone(),
                retries: item.retry_count,
            });
        }

        let json = serde_json::to_string(item)?;
        let now = Utc::now();

        if item.next_retry_at > now {
            self.store
                .zadd(
                    &self.key("delayed"),
                    &json,
                    item.next_retry_at.timestamp_millis() as f64,
                )
                .await?;
            debug!(
                queue = %self.name,
                item_id = %item.id,
                next_retry_at = %item.next_retry_at,
                "Item scheduled for later"
            );
        } else {
            self.store
                .zadd(
                    &self.key("pending"),
                    &json,
                    pending_score(item.priority, now),
                )
                .await?;
            debug!(
                queue = %self.name,
                item_id = %item.id,
                priority = item.priority.as_u8(),
                "Item queued"
            );
        }

        metrics::record_queue_event(&self.name, "queued");
        Ok(item.id.clone())
    }

    /// Claim the highest-priority due item, if any.
    ///
    /// The pop itself is atomic with respect to concurrent consumers; the
    /// claim then parks the item under a visibility deadline so a consumer
    /// that dies loses it back to pending instead of swallowing it.
    pub async fn pop(&self) -> Result<Option<QueueItem>> {
        let Some((json, _score)) = self.store.zpop_min(&self.key("pending")).await? else {
            return Ok(None);
        };

        let item: QueueItem = match serde_json::from_str(&json) {
            Ok(item) => item,
            Err(err) => {
                error!(queue = %self.name, error = %err, "Dead-lettering unparseable pending item");
                let key = self.dead_key(&format!("unparseable_{}", content_hash(&json)));
                self.store.set_ex(&key, &json, DEAD_LETTER_TTL).await?;
                return Ok(None);
            }
        };

        let deadline_ms =
            Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
        self.store
            .zadd(&self.key("processing"), &item.id, deadline_ms as f64)
            .await?;
        self.store.set(&self.claim_key(&item.id), &json).await?;

        debug!(queue = %self.name, item_id = %item.id, "Item claimed");
        Ok(Some(item))
    }

    /// Acknowledge successful replay.
    pub async fn complete(&self, id: &str) -> Result<()> {
        self.store.zrem(&self.key("processing"), id).await?;
        self.store.del(&self.claim_key(id)).await?;

        let marker = serde_json::json!({
            "id": id,
            "completed_at": Utc::now(),
        })
        .to_string();
        self.store
            .set_ex(&self.completed_key(id), &marker, COMPLETED_TTL)
            .await?;

        metrics::record_queue_event(&self.name, "completed");
        debug!(queue = %self.name, item_id = %id, "Item completed");
        Ok(())
    }

    /// Record a failed replay: reschedule with backoff, or dead-letter once
    /// the retry budget is spent.
    pub async fn fail(&self, item: &QueueItem, error: &str) -> Result<FailOutcome> {
        self.release_claim(&item.id).await?;

        // Delay is computed from the count before this failure, so the first
        // reschedule waits one base delay.
        let delay = self.policy.delay_for(item.retry_count);

        let mut updated = item.clone();
        updated.retry_count += 1;
        updated.last_error = Some(error.to_string());

        // An item that has failed max_retries times is spent.
        if updated.retry_count >= updated.max_retries {
            self.write_dead_letter(&updated).await?;
            return Ok(FailOutcome::DeadLettered);
        }

        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(86_400));
        updated.next_retry_at = Utc::now() + delay;

        let json = serde_json::to_string(&updated)?;
        self.store
            .zadd(
                &self.key("delayed"),
                &json,
                updated.next_retry_at.timestamp_millis() as f64,
            )
            .await?;

        warn!(
            queue = %self.name,
            item_id = %updated.id,
            retry_count = updated.retry_count,
            next_retry_at = %updated.next_retry_at,
            error = %error,
            "Item scheduled for retry"
        );
        Ok(FailOutcome::Rescheduled {
            retry_count: updated.retry_count,
            next_retry_at: updated.next_retry_at,
        })
    }

    /// Terminal routing for failures that will never succeed, regardless of
    /// remaining budget.
    pub async fn dead_letter(&self, item: &QueueItem, error: &str) -> Result<()> {
        self.release_claim(&item.id).await?;
        let mut updated = item.clone();
        updated.last_error = Some(error.to_string());
        self.write_dead_letter(&updated).await
    }

    /// Push the item back out by `delay` without consuming retry budget.
    /// Used when the target service is still unhealthy, which is not the
    /// item's fault.
    pub async fn defer(&self, item: &QueueItem, delay: Duration) -> Result<()> {
        self.release_claim(&item.id).await?;

        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(86_400));
        let mut updated = item.clone();
        updated.next_retry_at = Utc::now() + delay;

        let json = serde_json::to_string(&updated)?;
        self.store
            .zadd(
                &self.key("delayed"),
                &json,
                updated.next_retry_at.timestamp_millis() as f64,
            )
            .await?;

        debug!(
            queue = %self.name,
            item_id = %updated.id,
            next_retry_at = %updated.next_retry_at,
            "Item deferred, service unhealthy"
        );
        Ok(())
    }

    /// Move delayed items whose due time has passed into pending.
    pub async fn promote_due(&self) -> Result<u64> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let due = self
            .store
            .zpop_due(&self.key("delayed"), now_ms, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for json in due {
            match serde_json::from_str::<QueueItem>(&json) {
                Ok(item) => {
                    self.store
                        .zadd(
                            &self.key("pending"),
                            &json,
                            pending_score(item.priority, Utc::now()),
                        )
                        .await?;
                    promoted += 1;
                }
                Err(err) => {
                    error!(queue = %self.name, error = %err, "Dead-lettering unparseable delayed item");
                    let key = self.dead_key(&format!("unparseable_{}", content_hash(&json)));
                    self.store.set_ex(&key, &json, DEAD_LETTER_TTL).await?;
                }
            }
        }

        if promoted > 0 {
            debug!(queue = %self.name, promoted, "Promoted due items");
        }
        Ok(promoted)
    }

    /// Return items whose visibility deadline passed to pending.
    ///
    /// Re-adds before releasing the claim, so a crash mid-sweep duplicates
    /// an item rather than losing it.
    pub async fn recover_expired(&self) -> Result<u64> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let claims = self
            .store
            .zrange_withscores(&self.key("processing"), 0, -1)
            .await?;

        let mut recovered = 0;
        for (id, deadline_ms) in claims {
            if deadline_ms > now_ms {
                // Claims are ordered by deadline, the rest are still live
                break;
            }

            let Some(json) = self.store.get(&self.claim_key(&id)).await? else {
                // Claim index entry without payload, nothing left to recover
                self.store.zrem(&self.key("processing"), &id).await?;
                continue;
            };

            match serde_json::from_str::<QueueItem>(&json) {
                Ok(item) => {
                    self.store
                        .zadd(
                            &self.key("pending"),
                            &json,
                            pending_score(item.priority, Utc::now()),
                        )
                        .await?;
                    warn!(
                        queue = %self.name,
                        item_id = %id,
                        "Recovered item whose visibility timeout expired"
                    );
                    recovered += 1;
                }
                Err(err) => {
                    error!(queue = %self.name, item_id = %id, error = %err, "Dead-lettering unparseable claim");
                    self.store.set_ex(&self.dead_key(&id), &json, DEAD_LETTER_TTL).await?;
                }
            }

            self.store.zrem(&self.key("processing"), &id).await?;
            self.store.del(&self.claim_key(&id)).await?;
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let pending = self.store.zcard(&self.key("pending")).await?
            + self.store.zcard(&self.key("delayed")).await?;
        let processing = self.store.zcard(&self.key("processing")).await?;
        let failed = self.store.keys(&self.key("dead:*")).await?.len() as u64;
        let completed = self.store.keys(&self.key("completed:*")).await?.len() as u64;

        Ok(QueueStats {
            pending,
            processing,
            failed,
            completed,
        })
    }

    /// Oldest-first view of ready items without claiming them.
    pub async fn peek_pending(&self, limit: usize) -> Result<Vec<QueueItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self
            .store
            .zrange_withscores(&self.key("pending"), 0, limit as isize - 1)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|(json, _)| serde_json::from_str(&json).ok())
            .collect())
    }

    pub async fn dead_letters(&self) -> Result<Vec<QueueItem>> {
        let keys = self.store.keys(&self.key("dead:*")).await?;
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(json) = self.store.get(&key).await? {
                if let Ok(item) = serde_json::from_str::<QueueItem>(&json) {
                    items.push(item);
                }
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    /// Drop everything this queue owns. Test and break-glass tooling only.
    pub async fn clear(&self) -> Result<()> {
        for suffix in ["pending", "delayed", "processing"] {
            self.store.del(&self.key(suffix)).await?;
        }
        for pattern in ["processing:*", "dead:*", "completed:*"] {
            for key in self.store.keys(&self.key(pattern)).await? {
                self.store.del(&key).await?;
            }
        }
        Ok(())
    }

    async fn release_claim(&self, id: &str) -> Result<()> {
        self.store.zrem(&self.key("processing"), id).await?;
        self.store.del(&self.claim_key(id)).await?;
        Ok(())
    }

    async fn write_dead_letter(&self, item: &QueueItem) -> Result<()> {
        let json = serde_json::to_string(item)?;
        self.store
            .set_ex(&self.dead_key(&item.id), &json, DEAD_LETTER_TTL)
            .await?;
        metrics::record_queue_event(&self.name, "dead_lettered");
        warn!(
            queue = %self.name,
            item_id = %item.id,
            retry_count = item.retry_count,
            "Item dead-lettered"
        );
        Ok(())
    }
}

/// The fixed set of queues, routed by operation class.
#[derive(Clone)]
pub struct RetryQueues {
    orders: RetryQueue,
    fulfillments: RetryQueue,
    notifications: RetryQueue,
}

impl RetryQueues {
    pub fn new(
        store: Arc<dyn DurableStore>,
        policy: RetryPolicy,
        visibility_timeout: Duration,
    ) -> Self {
        let queue = |class: QueueClass| {
            RetryQueue::new(
                class.as_str(),
                store.clone(),
                policy.clone(),
                visibility_timeout,
            )
        };
        Self {
            orders: queue(QueueClass::Orders),
            fulfillments: queue(QueueClass::Fulfillments),
            notifications: queue(QueueClass::Notifications),
        }
    }

    pub fn for_class(&self, class: QueueClass) -> &RetryQueue {
        match class {
            QueueClass::Orders => &self.orders,
            QueueClass::Fulfillments => &self.fulfillments,
            QueueClass::Notifications => &self.notifications,
        }
    }

    pub fn for_operation(&self, operation: OperationKind) -> &RetryQueue {
        self.for_class(operation.queue_class())
    }

    pub fn all(&self) -> [&RetryQueue; 3] {
        [&self.orders, &self.fulfillments, &self.notifications]
    }

    /// Route by the item's operation.
    pub async fn push(&self, item: &QueueItem) -> Result<String> {
        self.for_operation(item.operation).push(item).await
    }

    pub async fn stats(&self) -> Result<HashMap<String, QueueStats>> {
        let mut all = HashMap::new();
        for queue in self.all() {
            all.insert(queue.name().to_string(), queue.stats().await?);
        }
        Ok(all)
    }
}
