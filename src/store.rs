//! Durable storage backing the retry queues, health snapshots and chaos
//! fault records.
//!
//! Production uses Redis through a [`ConnectionManager`]; tests and
//! single-process deployments can use [`MemoryStore`]. The trait surface is
//! deliberately small: key/value records with optional TTL plus sorted sets
//! with atomic pop operations, which is everything the queue and chaos
//! subsystems need.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;

/// Storage primitives required by the resilience layer.
///
/// Pattern arguments use Redis glob syntax; the in-memory implementation
/// supports only a trailing `*` wildcard, which is all this crate uses.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Insert or update a member; an existing member keeps one entry with
    /// the new score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    /// Range by rank with scores; negative indices count from the tail.
    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
    /// Atomically remove and return the lowest-scored member.
    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>>;
    /// Atomically remove and return up to `limit` members with
    /// `score <= max_score`, lowest first.
    async fn zpop_due(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>>;
}

/// Redis-backed store used in production.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry, so sub-second TTLs round up
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = conn.zrange_withscores(key, start, stop).await?;
        Ok(entries)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut conn = self.conn.clone();
        let mut popped: Vec<(String, f64)> = conn.zpopmin(key, 1).await?;
        Ok(popped.pop())
    }

    async fn zpop_due(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
            for _, member in ipairs(due) do
                redis.call('ZREM', KEYS[1], member)
            end
            return due
            "#,
        );
        let due: Vec<String> = script
            .key(key)
            .arg(max_score)
            .arg(limit as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(due)
    }
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, StoredValue>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl MemoryInner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.kv
            .retain(|_, v| v.expires_at.map_or(true, |at| at > now));
    }
}

/// In-process store with the same semantics as [`RedisStore`].
///
/// Every operation runs under one lock, so the multi-step pops are atomic
/// exactly like their Lua counterparts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Ascending (score, member) order, matching Redis sorted-set iteration.
fn sorted_entries(members: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut entries: Vec<(String, f64)> =
        members.iter().map(|(m, s)| (m.clone(), *s)).collect();
    entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.kv.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.kv.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.kv.get(key).map(|v| v.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let existed = inner.kv.remove(key).is_some() | inner.zsets.remove(key).is_some();
        Ok(existed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let mut matched: Vec<String> = inner
            .kv
            .keys()
            .chain(inner.zsets.keys())
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect();
        matched.sort();
        matched.dedup();
        Ok(matched)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.zsets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        let entries = match inner.zsets.get(key) {
            Some(members) => sorted_entries(members),
            None => return Ok(Vec::new()),
        };

        let len = entries.len() as isize;
        let from = if start < 0 { (len + start).max(0) } else { start };
        let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if from > to || from >= len || to < 0 {
            return Ok(Vec::new());
        }
        Ok(entries[from as usize..=to as usize].to_vec())
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut inner = self.inner.lock();
        let popped = inner.zsets.get(key).and_then(|members| {
            sorted_entries(members).into_iter().next()
        });
        if let Some((member, _)) = &popped {
            if let Some(members) = inner.zsets.get_mut(key) {
                members.remove(member);
            }
        }
        Ok(popped)
    }

    async fn zpop_due(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let due: Vec<String> = match inner.zsets.get(key) {
            Some(members) => sorted_entries(members)
                .into_iter()
                .filter(|(_, score)| *score <= max_score)
                .take(limit)
                .map(|(member, _)| member)
                .collect(),
            None => return Ok(Vec::new()),
        };
        if let Some(members) = inner.zsets.get_mut(key) {
            for member in &due {
                members.remove(member);
            }
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zpop_min_returns_lowest_score_first() {
        let store = MemoryStore::new();
        store.zadd("z", "c", 3.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();

        assert_eq!(store.zpop_min("z").await.unwrap(), Some(("a".into(), 1.0)));
        assert_eq!(store.zpop_min("z").await.unwrap(), Some(("b".into(), 2.0)));
        assert_eq!(store.zpop_min("z").await.unwrap(), Some(("c".into(), 3.0)));
        assert_eq!(store.zpop_min("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zpop_min_breaks_score_ties_by_member() {
        let store = MemoryStore::new();
        store.zadd("z", "beta", 5.0).await.unwrap();
        store.zadd("z", "alpha", 5.0).await.unwrap();

        assert_eq!(
            store.zpop_min("z").await.unwrap(),
            Some(("alpha".into(), 5.0))
        );
    }

    #[tokio::test]
    async fn zadd_updates_score_for_existing_member() {
        let store = MemoryStore::new();
        store.zadd("z", "a", 10.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zpop_min("z").await.unwrap(), Some(("a".into(), 1.0)));
    }

    #[tokio::test]
    async fn zpop_due_is_inclusive_and_bounded() {
        let store = MemoryStore::new();
        store.zadd("z", "early", 10.0).await.unwrap();
        store.zadd("z", "exact", 20.0).await.unwrap();
        store.zadd("z", "late", 30.0).await.unwrap();

        let due = store.zpop_due("z", 20.0, 10).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "exact".to_string()]);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zpop_due_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.zadd("z", &format!("m{}", i), i as f64).await.unwrap();
        }

        let due = store.zpop_due("z", 100.0, 2).await.unwrap();
        assert_eq!(due, vec!["m0".to_string(), "m1".to_string()]);
        assert_eq!(store.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_matches_trailing_wildcard() {
        let store = MemoryStore::new();
        store.set("chaos:svc-a:delay", "{}").await.unwrap();
        store.set("chaos:svc-a:failure", "{}").await.unwrap();
        store.set("chaos:svc-b:delay", "{}").await.unwrap();

        let keys = store.keys("chaos:svc-a:*").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("chaos:svc-a:")));
    }

    #[tokio::test]
    async fn zrange_supports_negative_stop() {
        let store = MemoryStore::new();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "c", 3.0).await.unwrap();

        let all = store.zrange_withscores("z", 0, -1).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, "a");
        assert_eq!(all[2].0, "c");

        let first_two = store.zrange_withscores("z", 0, 1).await.unwrap();
        assert_eq!(first_two.len(), 2);
    }

    // Requires a local Redis; run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn redis_store_round_trip() {
        let store = RedisStore::connect("redis://127.0.0.1:6379").await.unwrap();
        let key = "integration-resilience:test:roundtrip";

        store.del(key).await.unwrap();
        store.zadd(key, "x", 2.0).await.unwrap();
        store.zadd(key, "y", 1.0).await.unwrap();
        assert_eq!(
            store.zpop_min(key).await.unwrap(),
            Some(("y".into(), 1.0))
        );
        store.del(key).await.unwrap();
    }
}
