//! Durable storage backends for the hybrid queue.
//!
//! The durable store is the system of record: every enqueued item is
//! persisted here before it becomes available in memory, and removing
//! the durable copy is what acknowledges an item. Two implementations
//! are provided:
//!
//! - `RedisStore`: the production backend, over a redis
//!   `ConnectionManager`
//! - `MemoryStore`: a process-local backend for tests and redis-less
//!   local runs
//!
//! # Key layout (RedisStore)
//!
//! - `{name}:{stage}`: ZSET of ready job ids, scored by priority and
//!   enqueue time (lowest score dequeues first)
//! - `{name}:{stage}:items`: HASH job id -> serialized envelope
//! - `{name}:{stage}:in_flight`: HASH of claimed-but-unacked envelopes
//! - `{name}:dead_letter`: LIST of dead-letter entries
//! - `{name}:recoverable`: LIST of records awaiting re-verification
//! - `{name}:results:{id}`: analysis results, kept for 7 days

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

use crate::job::{DeadLetterItem, JobRecord, QueueItem, Stage};

/// How long analysis results are kept in the durable store.
const RESULT_TTL_SECS: u64 = 604_800; // 7 days

/// Errors from durable-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backend.
    #[error("store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize an envelope.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// System-of-record storage behind the hybrid queue.
///
/// All operations are keyed so that a crash between any two calls can
/// only cause redelivery, never loss.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Persists a ready item. Must complete before the enqueue is
    /// acknowledged to the caller.
    async fn persist(&self, item: &QueueItem) -> Result<(), StoreError>;

    /// Returns up to `limit` ready items in dequeue order without
    /// removing them.
    async fn load_ready(&self, stage: Stage, limit: usize) -> Result<Vec<QueueItem>, StoreError>;

    /// Moves an item from ready to in-flight. Called at dequeue time,
    /// before the item is handed to a worker.
    async fn mark_in_flight(&self, item: &QueueItem) -> Result<(), StoreError>;

    /// Removes the in-flight copy. This durable delete IS the ack.
    async fn ack(&self, stage: Stage, job_id: &str) -> Result<(), StoreError>;

    /// Requeues every in-flight item of a stage. Called on startup to
    /// recover from a crash. The attempt counter is preserved: the
    /// interrupted delivery was already counted at dequeue time.
    /// Returns the number of items recovered.
    async fn recover_in_flight(&self, stage: Stage) -> Result<usize, StoreError>;

    /// Appends a dead-letter entry.
    async fn push_dead_letter(&self, entry: &DeadLetterItem) -> Result<(), StoreError>;

    /// Returns up to `limit` dead-letter entries without removing them.
    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterItem>, StoreError>;

    /// Number of ready items in a stage.
    async fn ready_len(&self, stage: Stage) -> Result<usize, StoreError>;

    /// Number of in-flight items in a stage.
    async fn in_flight_len(&self, stage: Stage) -> Result<usize, StoreError>;

    /// Number of dead-letter entries.
    async fn dead_letter_len(&self) -> Result<usize, StoreError>;

    /// Persists an analyzed record so the outcome survives a crash
    /// between analysis and ack. Idempotent per job id.
    async fn save_result(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Loads a previously saved result.
    async fn load_result(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Parks a record for the re-verification sweep.
    async fn push_recoverable(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Removes and returns up to `limit` parked records.
    async fn drain_recoverable(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError>;
}

/// Score used for ready-set ordering: higher priority first, ties
/// broken FIFO by enqueue time. Lower score dequeues first.
fn ready_score(item: &QueueItem) -> f64 {
    -(item.priority as f64) * 1e13 + item.enqueued_at.timestamp_millis() as f64
}

/// Redis-backed durable store.
pub struct RedisStore {
    redis: ConnectionManager,
    name: String,
}

impl RedisStore {
    /// Connects to redis and creates a store with the given key prefix.
    pub async fn connect(redis_url: &str, name: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            redis,
            name: name.to_string(),
        })
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, name: &str) -> Self {
        Self {
            redis,
            name: name.to_string(),
        }
    }

    fn ready_key(&self, stage: Stage) -> String {
        format!("{}:{}", self.name, stage.as_str())
    }

    fn items_key(&self, stage: Stage) -> String {
        format!("{}:{}:items", self.name, stage.as_str())
    }

    fn in_flight_key(&self, stage: Stage) -> String {
        format!("{}:{}:in_flight", self.name, stage.as_str())
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead_letter", self.name)
    }

    fn recoverable_key(&self) -> String {
        format!("{}:recoverable", self.name)
    }

    fn result_key(&self, job_id: &str) -> String {
        format!("{}:results:{}", self.name, job_id)
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn persist(&self, item: &QueueItem) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(item)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.items_key(item.stage), &item.job.id, &serialized)
            .zadd(self.ready_key(item.stage), &item.job.id, ready_score(item));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn load_ready(&self, stage: Stage, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(self.ready_key(stage), 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = Vec::with_capacity(ids.len());
        for id in &ids {
            let data: Option<String> = conn.hget(self.items_key(stage), id).await?;
            if let Some(data) = data {
                items.push(serde_json::from_str(&data)?);
            }
        }
        Ok(items)
    }

    async fn mark_in_flight(&self, item: &QueueItem) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(item)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(self.ready_key(item.stage), &item.job.id)
            .hdel(self.items_key(item.stage), &item.job.id)
            .hset(self.in_flight_key(item.stage), &item.job.id, &serialized);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ack(&self, stage: Stage, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(self.in_flight_key(stage), job_id)
            .await?;
        Ok(())
    }

    async fn recover_in_flight(&self, stage: Stage) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> = conn.hgetall(self.in_flight_key(stage)).await?;

        let mut recovered = 0;
        for (id, data) in entries {
            let item: QueueItem = serde_json::from_str(&data)?;
            let serialized = serde_json::to_string(&item)?;

            // Requeue and clear the in-flight marker atomically per item
            let mut pipe = redis::pipe();
            pipe.atomic()
                .hset(self.items_key(stage), &id, &serialized)
                .zadd(self.ready_key(stage), &id, ready_score(&item))
                .hdel(self.in_flight_key(stage), &id);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn push_dead_letter(&self, entry: &DeadLetterItem) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(entry)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.dead_letter_key(), serialized)
            .await?;
        Ok(())
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterItem>, StoreError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(self.dead_letter_key(), 0, limit as isize - 1)
            .await?;
        data.iter()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    async fn ready_len(&self, stage: Stage) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(self.ready_key(stage)).await?;
        Ok(len)
    }

    async fn in_flight_len(&self, stage: Stage) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.hlen(self.in_flight_key(stage)).await?;
        Ok(len)
    }

    async fn dead_letter_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.dead_letter_key()).await?;
        Ok(len)
    }

    async fn save_result(&self, job: &JobRecord) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(self.result_key(&job.id), serialized, RESULT_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn load_result(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.result_key(job_id)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn push_recoverable(&self, job: &JobRecord) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.recoverable_key(), serialized)
            .await?;
        Ok(())
    }

    async fn drain_recoverable(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let mut drained = Vec::new();
        while drained.len() < limit {
            let data: Option<String> = conn.rpop(self.recoverable_key(), None).await?;
            match data {
                Some(s) => drained.push(serde_json::from_str(&s)?),
                None => break,
            }
        }
        Ok(drained)
    }
}

#[derive(Default)]
struct MemoryStoreInner {
    ready: HashMap<Stage, Vec<QueueItem>>,
    in_flight: HashMap<Stage, HashMap<String, QueueItem>>,
    dead_letter: Vec<DeadLetterItem>,
    results: HashMap<String, JobRecord>,
    recoverable: Vec<JobRecord>,
}

/// In-process durable store for tests and redis-less local runs.
///
/// "Durable" here means durable across the hybrid queue's in-memory
/// structure, not across process restarts.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn persist(&self, item: &QueueItem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let ready = inner.ready.entry(item.stage).or_default();
        ready.retain(|existing| existing.job.id != item.job.id);
        ready.push(item.clone());
        ready.sort_by(|a, b| {
            ready_score(a)
                .partial_cmp(&ready_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    async fn load_ready(&self, stage: Stage, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .ready
            .get(&stage)
            .map(|items| items.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_in_flight(&self, item: &QueueItem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(ready) = inner.ready.get_mut(&item.stage) {
            ready.retain(|existing| existing.job.id != item.job.id);
        }
        inner
            .in_flight
            .entry(item.stage)
            .or_default()
            .insert(item.job.id.clone(), item.clone());
        Ok(())
    }

    async fn ack(&self, stage: Stage, job_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(in_flight) = inner.in_flight.get_mut(&stage) {
            in_flight.remove(job_id);
        }
        Ok(())
    }

    async fn recover_in_flight(&self, stage: Stage) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let claimed: Vec<QueueItem> = inner
            .in_flight
            .get_mut(&stage)
            .map(|m| m.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();

        let recovered = claimed.len();
        let ready = inner.ready.entry(stage).or_default();
        for item in claimed {
            ready.push(item);
        }
        ready.sort_by(|a, b| {
            ready_score(a)
                .partial_cmp(&ready_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(recovered)
    }

    async fn push_dead_letter(&self, entry: &DeadLetterItem) -> Result<(), StoreError> {
        self.lock().dead_letter.push(entry.clone());
        Ok(())
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterItem>, StoreError> {
        Ok(self.lock().dead_letter.iter().take(limit).cloned().collect())
    }

    async fn ready_len(&self, stage: Stage) -> Result<usize, StoreError> {
        Ok(self.lock().ready.get(&stage).map_or(0, Vec::len))
    }

    async fn in_flight_len(&self, stage: Stage) -> Result<usize, StoreError> {
        Ok(self.lock().in_flight.get(&stage).map_or(0, HashMap::len))
    }

    async fn dead_letter_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock().dead_letter.len())
    }

    async fn save_result(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.lock().results.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_result(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.lock().results.get(job_id).cloned())
    }

    async fn push_recoverable(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.lock().recoverable.push(job.clone());
        Ok(())
    }

    async fn drain_recoverable(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let mut inner = self.lock();
        let take = limit.min(inner.recoverable.len());
        Ok(inner.recoverable.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;

    fn item(id: &str, priority: i32) -> QueueItem {
        QueueItem::with_priority(
            JobRecord::new(id, format!("http://x/{}", id), "Engineer", "Acme", "Remote"),
            Stage::Fetch,
            priority,
        )
    }

    #[tokio::test]
    async fn test_memory_store_persist_and_load_ordering() {
        let store = MemoryStore::new();
        store.persist(&item("low", 1)).await.unwrap();
        store.persist(&item("high", 5)).await.unwrap();
        store.persist(&item("mid", 3)).await.unwrap();

        let ready = store.load_ready(Stage::Fetch, 10).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.job.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_memory_store_fifo_tie_break() {
        let store = MemoryStore::new();
        let mut first = item("first", 2);
        let mut second = item("second", 2);
        first.enqueued_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        second.enqueued_at = chrono::Utc::now();
        store.persist(&second).await.unwrap();
        store.persist(&first).await.unwrap();

        let ready = store.load_ready(Stage::Fetch, 10).await.unwrap();
        assert_eq!(ready[0].job.id, "first");
    }

    #[tokio::test]
    async fn test_memory_store_in_flight_lifecycle() {
        let store = MemoryStore::new();
        let item = item("j1", 0);
        store.persist(&item).await.unwrap();
        assert_eq!(store.ready_len(Stage::Fetch).await.unwrap(), 1);

        store.mark_in_flight(&item).await.unwrap();
        assert_eq!(store.ready_len(Stage::Fetch).await.unwrap(), 0);
        assert_eq!(store.in_flight_len(Stage::Fetch).await.unwrap(), 1);

        store.ack(Stage::Fetch, "j1").await.unwrap();
        assert_eq!(store.in_flight_len(Stage::Fetch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_recovery_preserves_attempt() {
        let store = MemoryStore::new();
        let mut item = item("j1", 0);
        store.persist(&item).await.unwrap();
        // The dequeue path counts the delivery before marking in-flight
        item.increment_attempt();
        store.mark_in_flight(&item).await.unwrap();

        // Simulated crash: in-flight copy is still there on "restart"
        let recovered = store.recover_in_flight(Stage::Fetch).await.unwrap();
        assert_eq!(recovered, 1);

        let ready = store.load_ready(Stage::Fetch, 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].attempt, 1);
        assert_eq!(store.in_flight_len(Stage::Fetch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_dead_letter() {
        let store = MemoryStore::new();
        let entry = DeadLetterItem::new(item("j1", 0), "expired");
        store.push_dead_letter(&entry).await.unwrap();

        assert_eq!(store.dead_letter_len().await.unwrap(), 1);
        let peeked = store.peek_dead_letter(10).await.unwrap();
        assert_eq!(peeked[0].reason, "expired");
    }

    #[tokio::test]
    async fn test_memory_store_results_are_idempotent_per_id() {
        let store = MemoryStore::new();
        let mut job = JobRecord::new("j1", "http://x/j1", "Engineer", "Acme", "Remote");
        job.record_analysis(0.4, crate::job::AnalysisMethod::Ai);
        store.save_result(&job).await.unwrap();

        job.record_analysis(0.8, crate::job::AnalysisMethod::Ai);
        store.save_result(&job).await.unwrap();

        let loaded = store.load_result("j1").await.unwrap().unwrap();
        assert_eq!(loaded.compatibility_score, Some(0.8));
    }

    #[tokio::test]
    async fn test_memory_store_recoverable_drain() {
        let store = MemoryStore::new();
        for i in 0..3 {
            let job = JobRecord::new(
                format!("j{}", i),
                format!("http://x/{}", i),
                "Engineer",
                "Acme",
                "Remote",
            );
            store.push_recoverable(&job).await.unwrap();
        }

        let first = store.drain_recoverable(2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.drain_recoverable(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.drain_recoverable(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_ready_score_ordering() {
        let high = item("a", 10);
        let low = item("b", 1);
        assert!(ready_score(&high) < ready_score(&low));
    }
}
