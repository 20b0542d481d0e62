//! Command-line interface and composition root.
//!
//! `run` wires the whole pipeline together: durable store, hybrid
//! queue, connection pool, fetch and analysis orchestrators. The other
//! commands are operational: `stats` snapshots, dead-letter
//! inspection, and seeding jobs from a collector-produced JSON file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use crate::analysis::AnalysisOrchestrator;
use crate::analyzer::{ReliableAnalyzer, RemoteAnalyzer, RuleBasedAnalyzer};
use crate::batcher::JobBatcher;
use crate::config::PipelineConfig;
use crate::fetch::{BasicExtractor, FetchOrchestrator, HttpFetcher};
use crate::job::{JobRecord, QueueItem, Stage};
use crate::metrics::PipelineMetrics;
use crate::pool::RateLimitedPool;
use crate::queue::{DurableStore, HybridQueue, MemoryStore, RedisStore};

/// Job enrichment pipeline.
#[derive(Parser, Debug)]
#[command(name = "jobflow", version, about = "Resilient job enrichment pipeline")]
pub struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long, global = true, env = "JOBFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline until interrupted.
    Run {
        /// Override the fetch worker count.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print queue depth and counters.
    Stats,
    /// Inspect dead-letter entries.
    DeadLetter {
        /// Entries to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Enqueue collector-produced job stubs from a JSON file.
    Seed {
        /// Path to a JSON array of job stubs.
        #[arg(long)]
        file: PathBuf,

        /// Priority assigned to the seeded items.
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
}

/// Collector-facing stub format accepted by `seed`. Stubs without an
/// id get a generated one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedJob {
    #[serde(default)]
    id: Option<String>,
    source_url: String,
    title: String,
    company: String,
    #[serde(default)]
    location: String,
}

impl SeedJob {
    fn id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::from_env()?,
    };

    match config.redis_url.clone() {
        Some(url) => {
            let store = Arc::new(RedisStore::connect(&url, &config.queue_name).await?);
            dispatch(cli, config, store).await
        }
        None => {
            warn!("No redis URL configured, using in-memory store (state is not durable)");
            let store = Arc::new(MemoryStore::new());
            dispatch(cli, config, store).await
        }
    }
}

async fn dispatch<S: DurableStore>(
    cli: Cli,
    config: PipelineConfig,
    store: Arc<S>,
) -> anyhow::Result<()> {
    match cli.command {
        Command::Run { workers } => run_pipeline(config, store, workers).await,
        Command::Stats => print_stats(config, store).await,
        Command::DeadLetter { limit } => print_dead_letter(store, limit).await,
        Command::Seed { file, priority } => seed_jobs(config, store, &file, priority).await,
    }
}

async fn run_pipeline<S: DurableStore>(
    config: PipelineConfig,
    store: Arc<S>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let queue = Arc::new(HybridQueue::new(store, config.queue_config()));
    queue.start().await?;

    let pool = Arc::new(RateLimitedPool::new(config.pool_config())?);
    pool.start();

    let mut fetch_config = config.fetch_config();
    if let Some(workers) = workers {
        fetch_config.workers = workers;
    }
    let fetch = Arc::new(FetchOrchestrator::new(
        Arc::clone(&queue),
        Arc::new(HttpFetcher::new(Arc::clone(&pool))),
        Arc::new(BasicExtractor::new()),
        fetch_config,
    ));
    fetch.start();

    let analyzer = Arc::new(ReliableAnalyzer::with_policies(
        Arc::new(RemoteAnalyzer::new(config.remote_config())?),
        Arc::new(RuleBasedAnalyzer::new()),
        config.breaker_config(),
        config.retry_policy(),
    ));
    let batcher = Arc::new(JobBatcher::with_proc_probe(config.batcher_config()));
    batcher.start();

    let analysis = Arc::new(AnalysisOrchestrator::new(
        Arc::clone(&queue),
        Arc::clone(&analyzer),
        Arc::clone(&batcher),
        config.profile.clone(),
        config.analysis_config(),
    ));
    analysis.start();

    let metrics = Arc::new(PipelineMetrics::new()?);
    let mirror = spawn_metrics_mirror(
        Arc::clone(&metrics),
        Arc::clone(&queue),
        Arc::clone(&analyzer),
        Arc::clone(&batcher),
        Arc::clone(&fetch),
    );

    info!("Pipeline running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Producers stop before consumers so in-flight work drains.
    fetch.stop().await;
    analysis.stop().await;
    batcher.stop().await;
    pool.stop().await;
    queue.stop().await;
    mirror.abort();

    let stats = analysis.stats();
    info!(
        analyzed = stats.analyzed,
        queued_downstream = stats.queued_downstream,
        needs_processing = stats.needs_processing,
        failed = stats.failed,
        "Final counts"
    );
    println!("{}", metrics.export_metrics()?);
    Ok(())
}

fn spawn_metrics_mirror<S: DurableStore>(
    metrics: Arc<PipelineMetrics>,
    queue: Arc<HybridQueue<S>>,
    analyzer: Arc<ReliableAnalyzer>,
    batcher: Arc<JobBatcher>,
    fetch: Arc<FetchOrchestrator<S, HttpFetcher, BasicExtractor>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tick.tick().await;
            match queue.stats().await {
                Ok(stats) => metrics.observe_queue(&stats),
                Err(e) => warn!(error = %e, "Queue stats unavailable"),
            }
            metrics.observe_circuit(analyzer.breaker_state());
            metrics.observe_batch_size(batcher.stats().current_batch_size);
            metrics.observe_cache_hits(fetch.stats().cache_hits);
        }
    })
}

async fn print_stats<S: DurableStore>(
    config: PipelineConfig,
    store: Arc<S>,
) -> anyhow::Result<()> {
    let queue = HybridQueue::new(store, config.queue_config());
    let stats = queue.stats().await?;

    println!("queue ({}):", config.queue_name);
    for stage in Stage::ALL {
        println!(
            "  {:<12} ready={:<6} in_flight={}",
            stage.as_str(),
            stats.ready.get(&stage).copied().unwrap_or(0),
            stats.in_flight.get(&stage).copied().unwrap_or(0),
        );
    }
    println!("  dead_letter={}", stats.dead_letter);
    println!("  backpressure={}", stats.backpressure_count);
    println!("  expired={}", stats.expired_count);
    Ok(())
}

async fn print_dead_letter<S: DurableStore>(store: Arc<S>, limit: usize) -> anyhow::Result<()> {
    let entries = store.peek_dead_letter(limit).await?;
    if entries.is_empty() {
        println!("dead-letter store is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  stage={} attempt={} reason={} at={}",
            entry.item.job.id,
            entry.item.stage.as_str(),
            entry.item.attempt,
            entry.reason,
            entry.dead_lettered_at.to_rfc3339(),
        );
    }
    Ok(())
}

async fn seed_jobs<S: DurableStore>(
    config: PipelineConfig,
    store: Arc<S>,
    file: &std::path::Path,
    priority: i32,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let stubs: Vec<SeedJob> = serde_json::from_str(&raw)?;
    let queue = HybridQueue::new(store, config.queue_config());

    let mut seeded = 0usize;
    for stub in stubs {
        let job = JobRecord::new(
            stub.id(),
            stub.source_url,
            stub.title,
            stub.company,
            stub.location,
        );
        match queue
            .enqueue(QueueItem::with_priority(job, Stage::Fetch, priority))
            .await
        {
            Ok(()) => seeded += 1,
            Err(e) => warn!(error = %e, "Seed enqueue failed"),
        }
    }
    println!("seeded {} jobs at priority {}", seeded, priority);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_accepts_worker_override() {
        let cli = Cli::parse_from(["jobflow", "run", "--workers", "4"]);
        match cli.command {
            Command::Run { workers } => assert_eq!(workers, Some(4)),
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_seed_stub_accepts_camel_case() {
        let raw = r#"[{"id":"j1","sourceUrl":"http://x","title":"Engineer","company":"Acme"}]"#;
        let stubs: Vec<SeedJob> = serde_json::from_str(raw).unwrap();
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].id(), "j1");
        assert_eq!(stubs[0].source_url, "http://x");
        assert!(stubs[0].location.is_empty());
    }

    #[test]
    fn test_seed_stub_without_id_gets_generated_one() {
        let raw = r#"[{"sourceUrl":"http://x","title":"Engineer","company":"Acme"}]"#;
        let stubs: Vec<SeedJob> = serde_json::from_str(raw).unwrap();
        assert!(!stubs[0].id().is_empty());
    }
}
