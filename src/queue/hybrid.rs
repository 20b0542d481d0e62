//! Hybrid durable/in-memory job queue with priority and backpressure.
//!
//! The queue couples two stores:
//!
//! - the durable store (the system of record, survives restarts)
//! - a bounded in-memory priority heap for low-latency worker hand-off
//!
//! Durability always precedes availability: `enqueue` persists to the
//! durable store before the item becomes visible in memory, and the
//! durable delete performed by `ack` is what completes an item.
//!
//! # Background tasks
//!
//! - a synchronizer tops the heap up from the durable store whenever
//!   occupancy drops below the low-water mark, and recovers in-flight
//!   items from a crashed run on startup
//! - an expiry sweep dead-letters items older than the TTL with
//!   reason `"expired"`
//!
//! # Backpressure
//!
//! `enqueue` returns `QueueError::Backpressure` once in-memory
//! occupancy reaches the high-water mark. Callers must treat this as
//! "retry later", never as a fatal condition.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::job::{DeadLetterItem, QueueItem, Stage};

use super::store::{DurableStore, StoreError};

/// Dead-letter reason used by the expiry sweep.
pub const EXPIRED_REASON: &str = "expired";

/// Errors from hybrid queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// In-memory occupancy reached the high-water mark; retry later.
    #[error("queue backpressure: {occupancy}/{capacity} items in memory")]
    Backpressure { occupancy: usize, capacity: usize },

    /// The durable store failed.
    #[error("durable store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the hybrid queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Capacity of the in-memory priority structure.
    pub capacity: usize,
    /// Occupancy ratio at which `enqueue` starts rejecting.
    pub high_water_ratio: f64,
    /// Occupancy ratio below which the synchronizer refills from the
    /// durable store.
    pub low_water_ratio: f64,
    /// How often the synchronizer checks occupancy.
    pub sync_interval: Duration,
    /// Age after which an item is dead-lettered as expired.
    pub item_ttl: Duration,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,
    /// Delivery attempts before orchestrators dead-letter an item.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            high_water_ratio: 0.8,
            low_water_ratio: 0.5,
            sync_interval: Duration::from_secs(1),
            item_ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl QueueConfig {
    /// In-memory occupancy at which `enqueue` rejects.
    pub fn high_water_mark(&self) -> usize {
        ((self.capacity as f64) * self.high_water_ratio).ceil() as usize
    }

    /// In-memory occupancy below which the synchronizer refills.
    pub fn low_water_mark(&self) -> usize {
        ((self.capacity as f64) * self.low_water_ratio).floor() as usize
    }
}

/// Heap entry ordered by priority (higher first), ties FIFO.
struct HeapEntry(QueueItem);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: highest priority wins, then the
        // earlier enqueue time.
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.enqueued_at.cmp(&self.0.enqueued_at))
    }
}

/// In-memory side of the queue: one heap per stage plus an id set used
/// to deduplicate synchronizer refills against items already loaded.
#[derive(Default)]
struct MemoryState {
    heaps: HashMap<Stage, BinaryHeap<HeapEntry>>,
    loaded_ids: HashSet<String>,
    occupancy: usize,
}

impl MemoryState {
    fn insert(&mut self, item: QueueItem) -> bool {
        if !self.loaded_ids.insert(item.job.id.clone()) {
            return false;
        }
        self.heaps.entry(item.stage).or_default().push(HeapEntry(item));
        self.occupancy += 1;
        true
    }

    fn pop(&mut self, stage: Stage) -> Option<QueueItem> {
        let item = self.heaps.get_mut(&stage)?.pop()?.0;
        self.occupancy -= 1;
        // The id stays in `loaded_ids` until the durable in-flight mark
        // completes, so the synchronizer cannot re-load it meanwhile.
        Some(item)
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// In-memory occupancy across all stages.
    pub memory_occupancy: usize,
    /// In-memory capacity.
    pub memory_capacity: usize,
    /// Durable ready depth per stage.
    pub ready: HashMap<Stage, usize>,
    /// Durable in-flight depth per stage.
    pub in_flight: HashMap<Stage, usize>,
    /// Dead-letter entries.
    pub dead_letter: usize,
    /// Enqueue calls rejected with backpressure.
    pub backpressure_count: u64,
    /// Items dead-lettered by the expiry sweep.
    pub expired_count: u64,
    /// Successful enqueues.
    pub enqueued_total: u64,
    /// Successful acks.
    pub acked_total: u64,
}

/// Hybrid durable/in-memory priority queue.
pub struct HybridQueue<S: DurableStore> {
    store: Arc<S>,
    config: QueueConfig,
    memory: Mutex<MemoryState>,
    notify: Notify,
    backpressure_count: AtomicU64,
    expired_count: AtomicU64,
    enqueued_total: AtomicU64,
    acked_total: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: DurableStore> HybridQueue<S> {
    /// Creates a queue over the given durable store.
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            config,
            memory: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
            backpressure_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            enqueued_total: AtomicU64::new(0),
            acked_total: AtomicU64::new(0),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Recovers in-flight items from a previous run and starts the
    /// synchronizer and expiry-sweep tasks.
    ///
    /// The durable store is authoritative after a crash: whatever the
    /// previous process held in memory is gone, and anything it had
    /// claimed but not acked is requeued here.
    pub async fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        for stage in Stage::ALL {
            let recovered = self.store.recover_in_flight(stage).await?;
            if recovered > 0 {
                info!(stage = %stage, recovered, "Recovered in-flight items");
            }
        }

        let sync = Arc::clone(self);
        let mut sync_shutdown = self.shutdown_tx.subscribe();
        let sync_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sync.config.sync_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = sync.refill().await {
                            warn!(error = %e, "Queue synchronizer refill failed");
                        }
                    }
                    _ = sync_shutdown.recv() => break,
                }
            }
        });

        let sweep = Arc::clone(self);
        let mut sweep_shutdown = self.shutdown_tx.subscribe();
        let sweep_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = sweep.sweep_expired().await {
                            warn!(error = %e, "Queue expiry sweep failed");
                        }
                    }
                    _ = sweep_shutdown.recv() => break,
                }
            }
        });

        let mut background = self.background.lock().expect("background lock poisoned");
        background.push(sync_handle);
        background.push(sweep_handle);
        Ok(())
    }

    /// Signals background tasks to stop and waits for them.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().expect("background lock poisoned");
            background.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Enqueues an item: durable persist first, then in-memory insert.
    ///
    /// Returns `QueueError::Backpressure` once in-memory occupancy is
    /// at or above the high-water mark.
    pub async fn enqueue(&self, item: QueueItem) -> Result<(), QueueError> {
        {
            let memory = self.memory.lock().expect("memory lock poisoned");
            if memory.occupancy >= self.config.high_water_mark() {
                self.backpressure_count.fetch_add(1, Ordering::SeqCst);
                return Err(QueueError::Backpressure {
                    occupancy: memory.occupancy,
                    capacity: self.config.capacity,
                });
            }
        }

        self.store.persist(&item).await?;

        {
            let mut memory = self.memory.lock().expect("memory lock poisoned");
            // Under capacity the item goes straight to the heap; at
            // capacity it stays durable-only until the synchronizer
            // finds room.
            if memory.occupancy < self.config.capacity {
                memory.insert(item);
            }
        }

        self.enqueued_total.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Dequeues the highest-priority item of a stage, waiting up to
    /// `timeout` for one to arrive.
    ///
    /// The returned item is marked in-flight in the durable store and
    /// its attempt counter reflects this delivery. Ownership of the
    /// record transfers to the caller until `ack` or
    /// `move_to_dead_letter`.
    pub async fn dequeue(
        &self,
        stage: Stage,
        timeout: Duration,
    ) -> Result<Option<QueueItem>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let popped = {
                let mut memory = self.memory.lock().expect("memory lock poisoned");
                memory.pop(stage)
            };

            if let Some(mut item) = popped {
                item.increment_attempt();
                match self.store.mark_in_flight(&item).await {
                    Ok(()) => {
                        let mut memory = self.memory.lock().expect("memory lock poisoned");
                        memory.loaded_ids.remove(&item.job.id);
                        return Ok(Some(item));
                    }
                    Err(e) => {
                        // Hand-off failed: put the item back so it is
                        // not lost from the fast path.
                        let mut memory = self.memory.lock().expect("memory lock poisoned");
                        memory.loaded_ids.remove(&item.job.id);
                        memory.insert(item);
                        return Err(e.into());
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    /// Acknowledges a delivered item. The durable delete is the ack;
    /// a crash before this call leads to redelivery, never loss.
    pub async fn ack(&self, item: &QueueItem) -> Result<(), QueueError> {
        self.store.ack(item.stage, &item.job.id).await?;
        self.acked_total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Moves a delivered item to the dead-letter store.
    ///
    /// The queue never calls this on its own for delivery failures;
    /// that decision belongs to the orchestrator that understands the
    /// failure semantics.
    pub async fn move_to_dead_letter(
        &self,
        item: QueueItem,
        reason: impl Into<String>,
    ) -> Result<(), QueueError> {
        let stage = item.stage;
        let job_id = item.job.id.clone();
        let entry = DeadLetterItem::new(item, reason);
        self.store.push_dead_letter(&entry).await?;
        self.store.ack(stage, &job_id).await?;
        Ok(())
    }

    /// Returns aggregate queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (memory_occupancy, memory_capacity) = {
            let memory = self.memory.lock().expect("memory lock poisoned");
            (memory.occupancy, self.config.capacity)
        };

        let mut ready = HashMap::new();
        let mut in_flight = HashMap::new();
        for stage in Stage::ALL {
            ready.insert(stage, self.store.ready_len(stage).await?);
            in_flight.insert(stage, self.store.in_flight_len(stage).await?);
        }

        Ok(QueueStats {
            memory_occupancy,
            memory_capacity,
            ready,
            in_flight,
            dead_letter: self.store.dead_letter_len().await?,
            backpressure_count: self.backpressure_count.load(Ordering::SeqCst),
            expired_count: self.expired_count.load(Ordering::SeqCst),
            enqueued_total: self.enqueued_total.load(Ordering::SeqCst),
            acked_total: self.acked_total.load(Ordering::SeqCst),
        })
    }

    /// Access to the underlying durable store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Tops the in-memory heap up from the durable store when below
    /// the low-water mark.
    async fn refill(&self) -> Result<(), QueueError> {
        let (occupancy, room) = {
            let memory = self.memory.lock().expect("memory lock poisoned");
            (
                memory.occupancy,
                self.config.capacity.saturating_sub(memory.occupancy),
            )
        };
        if occupancy >= self.config.low_water_mark() || room == 0 {
            return Ok(());
        }

        let mut inserted = 0;
        for stage in Stage::ALL {
            let candidates = self.store.load_ready(stage, room).await?;
            if candidates.is_empty() {
                continue;
            }
            let mut memory = self.memory.lock().expect("memory lock poisoned");
            for item in candidates {
                if memory.occupancy >= self.config.capacity {
                    break;
                }
                if memory.insert(item) {
                    inserted += 1;
                }
            }
        }

        if inserted > 0 {
            debug!(inserted, "Synchronizer refilled in-memory queue");
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Dead-letters items older than the configured TTL with reason
    /// `"expired"`, both those loaded in memory and those still
    /// sitting durable-only. The durable side is scanned up to
    /// `capacity` ready items per stage.
    async fn sweep_expired(&self) -> Result<(), QueueError> {
        let ttl = chrono::Duration::from_std(self.config.item_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        // Pull expired items off the heaps, but keep their ids in
        // `loaded_ids` and their occupancy slots until the durable
        // claim below succeeds, mirroring the dequeue hand-off.
        // Releasing the id first would let the synchronizer reload the
        // still-ready durable copy and hand it to a worker while it is
        // being dead-lettered.
        let expired: Vec<QueueItem> = {
            let mut memory = self.memory.lock().expect("memory lock poisoned");
            let mut expired = Vec::new();
            for heap in memory.heaps.values_mut() {
                let entries = std::mem::take(heap);
                for HeapEntry(item) in entries.into_sorted_vec() {
                    if item.age() > ttl {
                        expired.push(item);
                    } else {
                        heap.push(HeapEntry(item));
                    }
                }
            }
            expired
        };

        let mut outcome = Ok(());
        let mut remaining = expired.into_iter();
        for item in remaining.by_ref() {
            warn!(job_id = %item.job.id, stage = %item.stage, "Dead-lettering expired item");
            if let Err(e) = self.store.mark_in_flight(&item).await {
                let mut memory = self.memory.lock().expect("memory lock poisoned");
                memory.heaps.entry(item.stage).or_default().push(HeapEntry(item));
                outcome = Err(e.into());
                break;
            }
            {
                let mut memory = self.memory.lock().expect("memory lock poisoned");
                memory.loaded_ids.remove(&item.job.id);
                memory.occupancy -= 1;
            }
            if let Err(e) = self.dead_letter_claimed(item).await {
                outcome = Err(e);
                break;
            }
        }
        // Anything not handed off goes back on the heap; its id and
        // occupancy slot were never released.
        let rest: Vec<QueueItem> = remaining.collect();
        if !rest.is_empty() {
            let mut memory = self.memory.lock().expect("memory lock poisoned");
            for item in rest {
                memory.heaps.entry(item.stage).or_default().push(HeapEntry(item));
            }
        }
        outcome?;

        self.sweep_expired_durable(ttl).await
    }

    /// Expires ready items that were never loaded into memory.
    async fn sweep_expired_durable(&self, ttl: chrono::Duration) -> Result<(), QueueError> {
        for stage in Stage::ALL {
            let candidates = self.store.load_ready(stage, self.config.capacity).await?;
            for item in candidates {
                if item.age() <= ttl {
                    continue;
                }
                // Reserve the id so the synchronizer cannot load the
                // item while it is claimed. An id already present
                // belongs to memory and was covered above.
                {
                    let mut memory = self.memory.lock().expect("memory lock poisoned");
                    if !memory.loaded_ids.insert(item.job.id.clone()) {
                        continue;
                    }
                }
                warn!(job_id = %item.job.id, stage = %item.stage, "Dead-lettering expired durable item");
                let claim = self.store.mark_in_flight(&item).await;
                {
                    let mut memory = self.memory.lock().expect("memory lock poisoned");
                    memory.loaded_ids.remove(&item.job.id);
                }
                claim?;
                self.dead_letter_claimed(item).await?;
            }
        }
        Ok(())
    }

    /// Dead-letters an item whose durable ready copy is already
    /// claimed as in-flight.
    async fn dead_letter_claimed(&self, item: QueueItem) -> Result<(), QueueError> {
        let stage = item.stage;
        let job_id = item.job.id.clone();
        let entry = DeadLetterItem::new(item, EXPIRED_REASON);
        self.store.push_dead_letter(&entry).await?;
        self.store.ack(stage, &job_id).await?;
        self.expired_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
