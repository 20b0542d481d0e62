//! Analysis orchestrator.
//!
//! Workers drain the analyze stage into the memory-aware batcher and
//! run emitted batches through the reliability layer. Each scored job
//! is routed: qualifying jobs go to the downstream stage, recoverable
//! ones are parked for the re-verification sweep, hopeless ones are
//! failed and dead-lettered. Results are persisted before the source
//! item is acked, so a crash in between duplicates work instead of
//! losing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analyzer::{CandidateProfile, Recommendation, ReliabilityStats, ReliableAnalyzer};
use crate::batcher::JobBatcher;
use crate::job::{JobRecord, JobStatus, QueueItem, Stage};
use crate::queue::{DurableStore, HybridQueue, QueueError};

/// Reason recorded when a job is rejected by the routing decision.
pub const ANALYSIS_REJECTED_REASON: &str = "analysis-rejected";

/// Analysis-stage tuning knobs.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Concurrent analysis workers.
    pub workers: usize,
    /// Score at or above which a job qualifies for downstream.
    pub score_threshold: f64,
    /// How long a worker blocks waiting for an item.
    pub dequeue_timeout: Duration,
    /// Delay before retrying a backpressured downstream enqueue.
    pub backpressure_delay: Duration,
    /// Items loaded per re-verification sweep.
    pub reverify_batch: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            score_threshold: 0.7,
            dequeue_timeout: Duration::from_secs(5),
            backpressure_delay: Duration::from_millis(500),
            reverify_batch: 100,
        }
    }
}

#[derive(Default)]
struct SharedAnalysisStats {
    analyzed: AtomicU64,
    queued_downstream: AtomicU64,
    needs_processing: AtomicU64,
    failed: AtomicU64,
    duplicates_skipped: AtomicU64,
    reverified: AtomicU64,
}

/// Snapshot of analysis-stage progress.
#[derive(Debug, Clone)]
pub struct AnalysisStats {
    /// Jobs scored.
    pub analyzed: u64,
    /// Jobs forwarded to the downstream stage.
    pub queued_downstream: u64,
    /// Jobs parked for re-verification.
    pub needs_processing: u64,
    /// Jobs failed and dead-lettered.
    pub failed: u64,
    /// Duplicate deliveries skipped via the saved result.
    pub duplicates_skipped: u64,
    /// Jobs re-enqueued by the re-verification sweep.
    pub reverified: u64,
    /// Reliability-layer counters.
    pub reliability: ReliabilityStats,
}

/// Batch-oriented worker pool for the analyze stage.
pub struct AnalysisOrchestrator<S: DurableStore + 'static> {
    queue: Arc<HybridQueue<S>>,
    analyzer: Arc<ReliableAnalyzer>,
    batcher: Arc<JobBatcher>,
    profile: CandidateProfile,
    config: AnalysisConfig,
    // Envelopes for jobs sitting in the batcher, keyed by job id, so
    // the delivered copy can be acked once its batch completes.
    pending: Mutex<HashMap<String, QueueItem>>,
    stats: Arc<SharedAnalysisStats>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: DurableStore + 'static> AnalysisOrchestrator<S> {
    pub fn new(
        queue: Arc<HybridQueue<S>>,
        analyzer: Arc<ReliableAnalyzer>,
        batcher: Arc<JobBatcher>,
        profile: CandidateProfile,
        config: AnalysisConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            analyzer,
            batcher,
            profile,
            pending: Mutex::new(HashMap::new()),
            stats: Arc::new(SharedAnalysisStats::default()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Spawns the analysis workers.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        for worker_id in 0..self.config.workers {
            let orchestrator = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "Analysis worker started");
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        dequeued = orchestrator
                            .queue
                            .dequeue(Stage::Analyze, orchestrator.config.dequeue_timeout) =>
                        {
                            match dequeued {
                                Ok(Some(item)) => orchestrator.accept_item(item).await,
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(worker_id, error = %e, "Analyze dequeue failed");
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                    }
                }
                debug!(worker_id, "Analysis worker stopped");
            }));
        }
        info!(workers = self.config.workers, "Analysis orchestrator started");
    }

    /// Signals shutdown, joins the workers and flushes the batcher so
    /// buffered jobs are still analyzed.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        let remainder = self.batcher.flush();
        if !remainder.is_empty() {
            info!(jobs = remainder.len(), "Flushing batcher on shutdown");
            self.process_batch(remainder).await;
        }
        info!("Analysis orchestrator stopped");
    }

    /// Buffers a delivered item; processes the batch the buffer emits.
    async fn accept_item(&self, item: QueueItem) {
        let job = item.job.clone();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(job.id.clone(), item);
        if let Some(batch) = self.batcher.add(job) {
            self.process_batch(batch).await;
        }
    }

    async fn process_batch(&self, batch: Vec<JobRecord>) {
        debug!(batch_size = batch.len(), "Processing analysis batch");
        for job in batch {
            let envelope = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&job.id);
            match envelope {
                Some(item) => self.process_one(item).await,
                None => warn!(job_id = %job.id, "Batched job has no pending envelope"),
            }
        }
    }

    async fn process_one(&self, mut item: QueueItem) {
        let job_id = item.job.id.clone();

        // At-least-once delivery: a crash after save_result but before
        // ack redelivers the item. The saved result makes the second
        // delivery a no-op apart from the ack.
        match self.queue.store().load_result(&job_id).await {
            Ok(Some(_)) => {
                debug!(job_id = %job_id, "Result already saved, skipping duplicate");
                self.stats.duplicates_skipped.fetch_add(1, Ordering::SeqCst);
                self.ack(&item).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Result lookup failed, leaving in flight");
                return;
            }
        }

        match item.job.status {
            JobStatus::DescriptionSaved => {
                if let Err(e) = item.job.advance(JobStatus::Analyzing) {
                    error!(job_id = %job_id, error = %e, "Rejecting inconsistent analyze item");
                    self.fail_item(item).await;
                    return;
                }
            }
            JobStatus::Analyzing => {}
            other => {
                error!(job_id = %job_id, status = ?other, "Unexpected status on analyze stage");
                self.fail_item(item).await;
                return;
            }
        }

        let (result, method) = self.analyzer.analyze(&item.job, &self.profile).await;
        item.job.record_analysis(result.compatibility_score, method);
        self.stats.analyzed.fetch_add(1, Ordering::SeqCst);
        debug!(
            job_id = %job_id,
            score = result.compatibility_score,
            method = ?method,
            "Job analyzed"
        );

        let qualifies = result.compatibility_score >= self.config.score_threshold
            || result.recommendation == Recommendation::Apply;

        if qualifies {
            self.route_downstream(item).await;
        } else if item.job.missing_required_fields() < 2 {
            self.route_needs_processing(item).await;
        } else {
            self.fail_item(item).await;
        }
    }

    async fn route_downstream(&self, mut item: QueueItem) {
        let job_id = item.job.id.clone();
        if item.job.advance(JobStatus::Analyzed).is_err()
            || item.job.advance(JobStatus::QueuedForDownstream).is_err()
        {
            error!(job_id = %job_id, "Status advance failed while routing downstream");
            self.fail_item(item).await;
            return;
        }

        if let Err(e) = self.queue.store().save_result(&item.job).await {
            warn!(job_id = %job_id, error = %e, "Result save failed, leaving in flight");
            return;
        }

        let next = QueueItem::with_priority(item.job.clone(), Stage::Downstream, item.priority);
        match self.enqueue_with_backpressure(next).await {
            Ok(()) => {
                self.ack(&item).await;
                self.stats.queued_downstream.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Downstream enqueue failed, leaving in flight");
            }
        }
    }

    async fn route_needs_processing(&self, mut item: QueueItem) {
        let job_id = item.job.id.clone();
        if let Err(e) = item.job.advance(JobStatus::NeedsProcessing) {
            error!(job_id = %job_id, error = %e, "Status advance failed while parking");
            self.fail_item(item).await;
            return;
        }

        if let Err(e) = self.queue.store().push_recoverable(&item.job).await {
            warn!(job_id = %job_id, error = %e, "Parking failed, leaving in flight");
            return;
        }
        self.ack(&item).await;
        self.stats.needs_processing.fetch_add(1, Ordering::SeqCst);
    }

    async fn fail_item(&self, mut item: QueueItem) {
        let job_id = item.job.id.clone();
        if item.job.status != JobStatus::Failed {
            if let Err(e) = item.job.advance(JobStatus::Failed) {
                error!(job_id = %job_id, error = %e, "Status advance to failed rejected");
            }
        }
        if let Err(e) = self
            .queue
            .move_to_dead_letter(item, ANALYSIS_REJECTED_REASON)
            .await
        {
            error!(job_id = %job_id, error = %e, "Dead-letter move failed");
            return;
        }
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-enqueues parked `needsProcessing` records at the fetch stage
    /// through the explicit recovery edge. Never runs automatically;
    /// an operator or scheduler invokes it.
    pub async fn run_reverify_sweep(&self) -> Result<usize, QueueError> {
        let parked = self
            .queue
            .store()
            .drain_recoverable(self.config.reverify_batch)
            .await
            .map_err(QueueError::from)?;

        let mut requeued = 0;
        for mut job in parked {
            let job_id = job.id.clone();
            if let Err(e) = job.advance(JobStatus::FetchingDescription) {
                warn!(job_id = %job_id, error = %e, "Parked record cannot re-enter fetch");
                continue;
            }
            job.description = None;
            match self
                .enqueue_with_backpressure(QueueItem::new(job, Stage::Fetch))
                .await
            {
                Ok(()) => {
                    requeued += 1;
                    self.stats.reverified.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Re-verification enqueue failed");
                }
            }
        }
        if requeued > 0 {
            info!(requeued, "Re-verification sweep requeued parked jobs");
        }
        Ok(requeued)
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            analyzed: self.stats.analyzed.load(Ordering::SeqCst),
            queued_downstream: self.stats.queued_downstream.load(Ordering::SeqCst),
            needs_processing: self.stats.needs_processing.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            duplicates_skipped: self.stats.duplicates_skipped.load(Ordering::SeqCst),
            reverified: self.stats.reverified.load(Ordering::SeqCst),
            reliability: self.analyzer.stats(),
        }
    }

    async fn ack(&self, item: &QueueItem) {
        if let Err(e) = self.queue.ack(item).await {
            warn!(job_id = %item.job.id, error = %e, "Ack failed");
        }
    }

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
}
