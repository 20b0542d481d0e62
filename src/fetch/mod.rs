//! Description-fetch orchestrator.
//!
//! A worker pool drains the fetch stage, fills in missing job
//! descriptions through the rate-limited connection pool (with a
//! URL-keyed content cache in front), and republishes enriched jobs to
//! the analyze stage. Items that exhaust their retry budget are
//! dead-lettered with reason `"fetch-failed"`.

pub mod cache;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::job::{JobStatus, QueueItem, Stage};
use crate::pool::{PoolError, RateLimitedPool};
use crate::queue::{DurableStore, HybridQueue, QueueError};

pub use cache::{CacheStats, ContentCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};

/// Reason recorded when a fetch permanently fails.
pub const FETCH_FAILED_REASON: &str = "fetch-failed";

/// Fields the extractor pulls out of a fetched page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedFields {
    pub description: String,
    pub salary: Option<String>,
    pub keywords: BTreeSet<String>,
}

/// Fetches raw page content for a URL.
///
/// Production wraps the rate-limited pool; tests supply mocks.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, PoolError>;
}

/// Pulls typed fields out of raw page content.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, content: &str) -> ExtractedFields;
}

/// [`ContentFetcher`] backed by the rate-limited connection pool.
pub struct HttpFetcher {
    pool: Arc<RateLimitedPool>,
}

impl HttpFetcher {
    pub fn new(pool: Arc<RateLimitedPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, PoolError> {
        self.pool.request(url).await
    }
}

/// Minimal extractor: strips markup, lifts a salary-looking token and
/// a fixed set of technology keywords out of the text.
pub struct BasicExtractor {
    tag: Regex,
    salary: Regex,
    word: Regex,
    known_keywords: BTreeSet<String>,
}

impl BasicExtractor {
    pub fn new() -> Self {
        let known_keywords = [
            "rust", "python", "go", "java", "javascript", "typescript", "react", "sql",
            "postgres", "redis", "kafka", "docker", "kubernetes", "aws", "gcp", "azure",
            "linux", "terraform", "grpc", "graphql",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self {
            tag: Regex::new(r"<[^>]+>").expect("valid tag regex"),
            salary: Regex::new(r"\$\s?\d[\d,]*(?:k|K)?(?:\s?-\s?\$?\s?\d[\d,]*(?:k|K)?)?")
                .expect("valid salary regex"),
            word: Regex::new(r"[A-Za-z][A-Za-z+#.]{1,}").expect("valid word regex"),
            known_keywords,
        }
    }
}

impl Default for BasicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldExtractor for BasicExtractor {
    fn extract(&self, content: &str) -> ExtractedFields {
        let text = self.tag.replace_all(content, " ");
        let description = text.split_whitespace().collect::<Vec<_>>().join(" ");

        let salary = self
            .salary
            .find(&description)
            .map(|m| m.as_str().to_string());

        let keywords = self
            .word
            .find_iter(&description)
            .map(|m| m.as_str().to_lowercase())
            .filter(|w| self.known_keywords.contains(w))
            .collect();

        ExtractedFields {
            description,
            salary,
            keywords,
        }
    }
}

/// Fetch-stage tuning knobs.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Concurrent fetch workers.
    pub workers: usize,
    /// Deliveries allowed per item before dead-lettering.
    pub max_attempts: u32,
    /// How long a worker blocks waiting for an item.
    pub dequeue_timeout: Duration,
    /// Delay before retrying a backpressured downstream enqueue.
    pub backpressure_delay: Duration,
    /// Content-cache entry lifetime.
    pub cache_ttl: Duration,
    /// Content-cache entry bound.
    pub cache_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_attempts: 3,
            dequeue_timeout: Duration::from_secs(5),
            backpressure_delay: Duration::from_millis(500),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Default)]
struct SharedFetchStats {
    processed: AtomicU64,
    fetched: AtomicU64,
    cache_hits: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    active_workers: AtomicUsize,
}

/// Snapshot of fetch-stage progress.
#[derive(Debug, Clone)]
pub struct FetchStats {
    /// Items completed and forwarded to the analyze stage.
    pub processed: u64,
    /// Network fetches performed (cache misses).
    pub fetched: u64,
    /// Lookups served from the content cache.
    pub cache_hits: u64,
    /// Items re-enqueued for another attempt.
    pub retried: u64,
    /// Items dead-lettered.
    pub dead_lettered: u64,
    /// Workers currently handling an item.
    pub active_workers: usize,
    /// Content-cache counters.
    pub cache: CacheStats,
}

/// Worker pool for the fetch stage.
pub struct FetchOrchestrator<S, F, X>
where
    S: DurableStore + 'static,
    F: ContentFetcher + 'static,
    X: FieldExtractor + 'static,
{
    queue: Arc<HybridQueue<S>>,
    fetcher: Arc<F>,
    extractor: Arc<X>,
    cache: Arc<ContentCache>,
    config: FetchConfig,
    stats: Arc<SharedFetchStats>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, F, X> FetchOrchestrator<S, F, X>
where
    S: DurableStore + 'static,
    F: ContentFetcher + 'static,
    X: FieldExtractor + 'static,
{
    /// Creates the orchestrator over its queue, fetcher and extractor.
    pub fn new(
        queue: Arc<HybridQueue<S>>,
        fetcher: Arc<F>,
        extractor: Arc<X>,
        config: FetchConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            fetcher,
            extractor,
            cache: Arc::new(ContentCache::new(config.cache_ttl, config.cache_capacity)),
            stats: Arc::new(SharedFetchStats::default()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Spawns the fetch workers.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        for worker_id in 0..self.config.workers {
            let orchestrator = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "Fetch worker started");
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        dequeued = orchestrator
                            .queue
                            .dequeue(Stage::Fetch, orchestrator.config.dequeue_timeout) =>
                        {
                            match dequeued {
                                Ok(Some(item)) => {
                                    orchestrator.stats.active_workers.fetch_add(1, Ordering::SeqCst);
                                    orchestrator.handle_item(worker_id, item).await;
                                    orchestrator.stats.active_workers.fetch_sub(1, Ordering::SeqCst);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(worker_id, error = %e, "Fetch dequeue failed");
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                    }
                }
                debug!(worker_id, "Fetch worker stopped");
            }));
        }
        info!(workers = self.config.workers, "Fetch orchestrator started");
    }

    /// Signals shutdown and joins the workers.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Fetch orchestrator stopped");
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            processed: self.stats.processed.load(Ordering::SeqCst),
            fetched: self.stats.fetched.load(Ordering::SeqCst),
            cache_hits: self.stats.cache_hits.load(Ordering::SeqCst),
            retried: self.stats.retried.load(Ordering::SeqCst),
            dead_lettered: self.stats.dead_lettered.load(Ordering::SeqCst),
            active_workers: self.stats.active_workers.load(Ordering::SeqCst),
            cache: self.cache.stats(),
        }
    }

    /// Shared content cache, exposed for composition and tests.
    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    async fn handle_item(&self, worker_id: usize, mut item: QueueItem) {
        let job_id = item.job.id.clone();
        debug!(worker_id, job_id = %job_id, attempt = item.attempt, "Fetching description");

        // Duplicate delivery after a crash: the job may already be past
        // the fetch phase. Forward it instead of refetching.
        match item.job.status {
            JobStatus::Scraped => {
                if let Err(e) = item.job.advance(JobStatus::FetchingDescription) {
                    error!(job_id = %job_id, error = %e, "Rejecting inconsistent fetch item");
                    self.dead_letter(item, FETCH_FAILED_REASON).await;
                    return;
                }
            }
            JobStatus::FetchingDescription => {}
            JobStatus::DescriptionSaved => {
                self.forward_and_ack(item).await;
                return;
            }
            other => {
                error!(job_id = %job_id, status = ?other, "Unexpected status on fetch stage");
                self.dead_letter(item, FETCH_FAILED_REASON).await;
                return;
            }
        }

        let url = item.job.source_url.clone();
        let fields = match self.cache.get(&url) {
            Some(fields) => {
                self.stats.cache_hits.fetch_add(1, Ordering::SeqCst);
                fields
            }
            None => match self.fetcher.fetch(&url).await {
                Ok(content) => {
                    self.stats.fetched.fetch_add(1, Ordering::SeqCst);
                    let fields = self.extractor.extract(&content);
                    self.cache.insert(&url, fields.clone());
                    fields
                }
                Err(e) => {
                    self.handle_fetch_failure(item, e).await;
                    return;
                }
            },
        };

        item.job.description = Some(fields.description);
        if item.job.salary.is_none() {
            item.job.salary = fields.salary;
        }
        item.job.keywords.extend(fields.keywords);

        if let Err(e) = item.job.advance(JobStatus::DescriptionSaved) {
            error!(job_id = %job_id, error = %e, "Status advance failed after fetch");
            self.dead_letter(item, FETCH_FAILED_REASON).await;
            return;
        }

        self.forward_and_ack(item).await;
    }

    async fn handle_fetch_failure(&self, mut item: QueueItem, error: PoolError) {
        let job_id = item.job.id.clone();
        item.job.record_error(error.to_string());

        let retryable = matches!(error, PoolError::RetriesExhausted { .. })
            && item.should_retry(self.config.max_attempts);

        if retryable {
            warn!(job_id = %job_id, attempt = item.attempt, error = %error, "Fetch failed, re-enqueueing");
            self.stats.retried.fetch_add(1, Ordering::SeqCst);
            self.requeue_same_stage(item).await;
        } else {
            warn!(job_id = %job_id, attempt = item.attempt, error = %error, "Fetch failed permanently");
            self.dead_letter(item, FETCH_FAILED_REASON).await;
        }
    }

    /// Re-enqueues a failed item on the fetch stage, keeping its
    /// attempt counter, then acks the delivered copy.
    async fn requeue_same_stage(&self, item: QueueItem) {
        let delivered = item.clone();
        match self.enqueue_with_backpressure(item).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&delivered).await {
                    warn!(job_id = %delivered.job.id, error = %e, "Ack failed after requeue");
                }
            }
            Err(e) => {
                // Leave unacked; at-least-once delivery will retry it.
                warn!(job_id = %delivered.job.id, error = %e, "Requeue failed, leaving in flight");
            }
        }
    }

    /// Publishes the enriched job to the analyze stage, then acks the
    /// fetch-stage copy. Enqueue happens first so a crash in between
    /// duplicates the item rather than losing it.
    async fn forward_and_ack(&self, item: QueueItem) {
        let next = QueueItem::with_priority(item.job.clone(), Stage::Analyze, item.priority);
        match self.enqueue_with_backpressure(next).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&item).await {
                    warn!(job_id = %item.job.id, error = %e, "Ack failed after forward");
                    return;
                }
                self.stats.processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(job_id = %item.job.id, error = %e, "Forward to analyze stage failed");
            }
        }
    }

    /// Enqueues, treating backpressure as "retry shortly" rather than
    /// item failure.
    async fn enqueue_with_backpressure(&self, item: QueueItem) -> Result<(), QueueError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            match self.queue.enqueue(item.clone()).await {
                Ok(()) => return Ok(()),
                Err(QueueError::Backpressure { .. }) => {
                    debug!(job_id = %item.job.id, "Downstream backpressure, delaying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.backpressure_delay) => {}
                        _ = shutdown.recv() => {
                            return Err(QueueError::Backpressure {
                                occupancy: 0,
                                capacity: 0,
                            });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dead_letter(&self, item: QueueItem, reason: &str) {
        let job_id = item.job.id.clone();
        if let Err(e) = self.queue.move_to_dead_letter(item, reason).await {
            error!(job_id = %job_id, error = %e, "Dead-letter move failed");
            return;
        }
        self.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }
}
