//! End-to-end pipeline scenarios over the in-memory store with mock
//! network backends.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use jobflow::analysis::{AnalysisConfig, AnalysisOrchestrator};
use jobflow::analyzer::{
    AnalysisResult, Analyzer, BreakerConfig, CandidateProfile, Recommendation, ReliableAnalyzer,
    RetryPolicy, RuleBasedAnalyzer,
};
use jobflow::batcher::{BatcherConfig, JobBatcher, MemoryProbe};
use jobflow::error::AnalyzerError;
use jobflow::fetch::{BasicExtractor, ContentFetcher, FetchConfig, FetchOrchestrator};
use jobflow::job::{JobRecord, JobStatus, QueueItem, Stage};
use jobflow::pool::PoolError;
use jobflow::queue::{DurableStore, HybridQueue, MemoryStore, QueueConfig};

struct StaticFetcher;

#[async_trait]
impl ContentFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, PoolError> {
        Ok("<html><body>Senior engineer building Rust services on Kubernetes.</body></html>"
            .to_string())
    }
}

struct FixedRemote {
    score: f64,
    recommendation: Recommendation,
}

#[async_trait]
impl Analyzer for FixedRemote {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn analyze(
        &self,
        _job: &JobRecord,
        _profile: &CandidateProfile,
    ) -> Result<AnalysisResult, AnalyzerError> {
        Ok(AnalysisResult {
            compatibility_score: self.score,
            confidence: 0.9,
            skill_matches: Vec::new(),
            skill_gaps: Vec::new(),
            recommendation: self.recommendation,
            reasoning: "fixed".to_string(),
        })
    }
}

struct FailingRemote;

#[async_trait]
impl Analyzer for FailingRemote {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn analyze(
        &self,
        _job: &JobRecord,
        _profile: &CandidateProfile,
    ) -> Result<AnalysisResult, AnalyzerError> {
        Err(AnalyzerError::Api {
            code: 500,
            message: "internal error".to_string(),
        })
    }
}

struct FixedProbe;

impl MemoryProbe for FixedProbe {
    fn usage_fraction(&self) -> std::io::Result<f64> {
        Ok(0.55)
    }
}

fn stub(id: &str) -> JobRecord {
    JobRecord::new(
        id,
        format!("http://example.com/jobs/{}", id),
        "Engineer",
        "Acme",
        "Remote",
    )
}

fn profile() -> CandidateProfile {
    CandidateProfile {
        skills: BTreeSet::from(["rust".to_string(), "kubernetes".to_string()]),
        ..Default::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        multiplier: 2.0,
        jitter: 0.0,
        max_delay: Duration::from_millis(5),
    }
}

fn reliable(remote: Arc<dyn Analyzer>) -> Arc<ReliableAnalyzer> {
    Arc::new(ReliableAnalyzer::with_policies(
        remote,
        Arc::new(RuleBasedAnalyzer::new()),
        BreakerConfig::default(),
        fast_retry(),
    ))
}

fn per_item_batcher() -> Arc<JobBatcher> {
    Arc::new(JobBatcher::new(
        BatcherConfig {
            min_batch_size: 1,
            initial_batch_size: 1,
            ..Default::default()
        },
        Arc::new(FixedProbe),
    ))
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

#[tokio::test]
async fn scenario_a_priority_ordering() {
    let queue = Arc::new(HybridQueue::new(
        Arc::new(MemoryStore::new()),
        QueueConfig::default(),
    ));

    queue
        .enqueue(QueueItem::with_priority(stub("j2"), Stage::Fetch, 1))
        .await
        .unwrap();
    queue
        .enqueue(QueueItem::with_priority(stub("j1"), Stage::Fetch, 5))
        .await
        .unwrap();

    let first = queue
        .dequeue(Stage::Fetch, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("first item");
    let second = queue
        .dequeue(Stage::Fetch, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("second item");

    assert_eq!(first.job.id, "j1");
    assert_eq!(second.job.id, "j2");
}

#[tokio::test]
async fn scenario_b_backend_failures_fall_back_to_rules() {
    let chain = reliable(Arc::new(FailingRemote));
    let mut job = stub("j1");
    job.description = Some("Rust on Kubernetes".to_string());

    let (result, method) = chain.analyze(&job, &profile()).await;

    assert_eq!(method, jobflow::job::AnalysisMethod::RuleBased);
    assert!(result.compatibility_score > 0.0);
    // Three transient attempts were retried; the circuit counted each.
    assert_eq!(chain.breaker().failures_total(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_c_score_routing() {
    for (score, expect_downstream) in [(0.75, true), (0.4, false)] {
        let queue = Arc::new(HybridQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default(),
        ));
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            Arc::clone(&queue),
            reliable(Arc::new(FixedRemote {
                score,
                recommendation: Recommendation::Consider,
            })),
            per_item_batcher(),
            profile(),
            AnalysisConfig {
                workers: 1,
                dequeue_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        orchestrator.start();

        let mut job = stub("j1");
        job.description = Some("Rust on Kubernetes".to_string());
        job.advance(JobStatus::FetchingDescription).unwrap();
        job.advance(JobStatus::DescriptionSaved).unwrap();
        queue
            .enqueue(QueueItem::new(job, Stage::Analyze))
            .await
            .unwrap();

        let stats = Arc::clone(&orchestrator);
        assert!(
            wait_until(Duration::from_secs(5), || stats.stats().analyzed == 1).await,
            "job was not analyzed in time"
        );
        orchestrator.stop().await;

        if expect_downstream {
            let downstream = queue
                .dequeue(Stage::Downstream, Duration::from_millis(100))
                .await
                .unwrap()
                .expect("downstream item");
            assert_eq!(downstream.job.status, JobStatus::QueuedForDownstream);
            assert_eq!(downstream.job.compatibility_score, Some(score));
        } else {
            assert_eq!(orchestrator.stats().needs_processing, 1);
            assert!(queue
                .dequeue(Stage::Downstream, Duration::from_millis(50))
                .await
                .unwrap()
                .is_none());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_pipeline_enriches_and_routes() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(HybridQueue::new(Arc::clone(&store), QueueConfig::default()));
    queue.start().await.unwrap();

    let fetch = Arc::new(FetchOrchestrator::new(
        Arc::clone(&queue),
        Arc::new(StaticFetcher),
        Arc::new(BasicExtractor::new()),
        FetchConfig {
            workers: 2,
            dequeue_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    fetch.start();

    let analysis = Arc::new(AnalysisOrchestrator::new(
        Arc::clone(&queue),
        reliable(Arc::new(FixedRemote {
            score: 0.9,
            recommendation: Recommendation::Apply,
        })),
        per_item_batcher(),
        profile(),
        AnalysisConfig {
            workers: 2,
            dequeue_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    analysis.start();

    for i in 0..5 {
        queue
            .enqueue(QueueItem::new(stub(&format!("j{}", i)), Stage::Fetch))
            .await
            .unwrap();
    }

    let stats = Arc::clone(&analysis);
    assert!(
        wait_until(Duration::from_secs(10), || {
            stats.stats().queued_downstream == 5
        })
        .await,
        "jobs did not reach downstream in time"
    );

    fetch.stop().await;
    analysis.stop().await;
    queue.stop().await;

    // Every job made it through enriched and scored.
    let mut seen = BTreeSet::new();
    while let Some(item) = queue
        .dequeue(Stage::Downstream, Duration::from_millis(50))
        .await
        .unwrap()
    {
        assert_eq!(item.job.status, JobStatus::QueuedForDownstream);
        assert!(item.job.description.as_deref().unwrap().contains("Rust"));
        assert_eq!(item.job.compatibility_score, Some(0.9));
        seen.insert(item.job.id.clone());
        queue.ack(&item).await.unwrap();
    }
    assert_eq!(seen.len(), 5);
    assert_eq!(fetch.stats().processed, 5);
}

#[tokio::test]
async fn redelivery_after_crash_preserves_item() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(HybridQueue::new(Arc::clone(&store), QueueConfig::default()));

    queue
        .enqueue(QueueItem::new(stub("j1"), Stage::Fetch))
        .await
        .unwrap();
    let delivered = queue
        .dequeue(Stage::Fetch, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("delivered");
    assert_eq!(delivered.attempt, 1);

    // Crash before ack: a fresh queue over the same store recovers the
    // in-flight copy.
    let restarted = Arc::new(HybridQueue::new(Arc::clone(&store), QueueConfig::default()));
    restarted.start().await.unwrap();
    let redelivered = restarted
        .dequeue(Stage::Fetch, Duration::from_millis(200))
        .await
        .unwrap()
        .expect("redelivered");
    assert_eq!(redelivered.job.id, "j1");
    assert_eq!(redelivered.attempt, 2);

    restarted.ack(&redelivered).await.unwrap();
    restarted.stop().await;
    assert_eq!(store.in_flight_len(Stage::Fetch).await.unwrap(), 0);
}

#[tokio::test]
async fn reverify_sweep_requeues_parked_jobs() {
    let queue = Arc::new(HybridQueue::new(
        Arc::new(MemoryStore::new()),
        QueueConfig::default(),
    ));
    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        Arc::clone(&queue),
        reliable(Arc::new(FixedRemote {
            score: 0.2,
            recommendation: Recommendation::Skip,
        })),
        per_item_batcher(),
        profile(),
        AnalysisConfig {
            workers: 1,
            dequeue_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    orchestrator.start();

    let mut job = stub("j1");
    job.description = Some("Unrelated role".to_string());
    job.advance(JobStatus::FetchingDescription).unwrap();
    job.advance(JobStatus::DescriptionSaved).unwrap();
    queue
        .enqueue(QueueItem::new(job, Stage::Analyze))
        .await
        .unwrap();

    let stats = Arc::clone(&orchestrator);
    assert!(wait_until(Duration::from_secs(5), || stats.stats().needs_processing == 1).await);
    orchestrator.stop().await;

    // Nothing re-enters the pipeline until the sweep runs.
    assert!(queue
        .dequeue(Stage::Fetch, Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());

    let requeued = orchestrator.run_reverify_sweep().await.unwrap();
    assert_eq!(requeued, 1);
    let refetch = queue
        .dequeue(Stage::Fetch, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("refetch item");
    assert_eq!(refetch.job.id, "j1");
    assert_eq!(refetch.job.status, JobStatus::FetchingDescription);
}
