//! Hybrid job queue: durable system of record plus a bounded
//! in-memory priority structure for low-latency worker hand-off.

pub mod hybrid;
pub mod store;

pub use hybrid::{HybridQueue, QueueConfig, QueueError, QueueStats, EXPIRED_REASON};
pub use store::{DurableStore, MemoryStore, RedisStore, StoreError};
