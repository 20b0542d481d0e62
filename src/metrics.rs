//! Prometheus metrics for the pipeline.
//!
//! Pull-model only: components keep their own `stats()` snapshots as
//! the primary observability surface, and this registry mirrors the
//! interesting numbers for scraping.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

use crate::analyzer::BreakerState;
use crate::queue::QueueStats;

/// Errors from metric registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics encoding produced invalid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Registry plus the pipeline's metric families.
pub struct PipelineMetrics {
    registry: Registry,
    queue_depth: IntGaugeVec,
    backpressure_total: IntCounter,
    jobs_processed_total: IntCounterVec,
    circuit_state: IntGauge,
    fetch_cache_hits_total: IntCounter,
    batch_size: IntGauge,
    dead_letter_depth: IntGauge,
}

impl PipelineMetrics {
    /// Creates and registers the metric families.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let queue_depth = IntGaugeVec::new(
            Opts::new("jobflow_queue_depth", "Durable ready depth per stage"),
            &["stage"],
        )?;
        let backpressure_total = IntCounter::with_opts(Opts::new(
            "jobflow_backpressure_total",
            "Enqueue calls rejected with backpressure",
        ))?;
        let jobs_processed_total = IntCounterVec::new(
            Opts::new(
                "jobflow_jobs_processed_total",
                "Jobs that reached a routing outcome",
            ),
            &["outcome"],
        )?;
        let circuit_state = IntGauge::with_opts(Opts::new(
            "jobflow_circuit_state",
            "Analyzer circuit state (0 closed, 1 half-open, 2 open)",
        ))?;
        let fetch_cache_hits_total = IntCounter::with_opts(Opts::new(
            "jobflow_fetch_cache_hits_total",
            "Fetch lookups served from the content cache",
        ))?;
        let batch_size = IntGauge::with_opts(Opts::new(
            "jobflow_batch_size",
            "Current target analysis batch size",
        ))?;
        let dead_letter_depth = IntGauge::with_opts(Opts::new(
            "jobflow_dead_letter_depth",
            "Entries in the dead-letter store",
        ))?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(backpressure_total.clone()))?;
        registry.register(Box::new(jobs_processed_total.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(fetch_cache_hits_total.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(dead_letter_depth.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            backpressure_total,
            jobs_processed_total,
            circuit_state,
            fetch_cache_hits_total,
            batch_size,
            dead_letter_depth,
        })
    }

    /// Mirrors a queue stats snapshot into the gauges.
    pub fn observe_queue(&self, stats: &QueueStats) {
        for (stage, depth) in &stats.ready {
            self.queue_depth
                .with_label_values(&[stage.as_str()])
                .set(*depth as i64);
        }
        self.dead_letter_depth.set(stats.dead_letter as i64);

        let seen = self.backpressure_total.get();
        if stats.backpressure_count > seen {
            self.backpressure_total.inc_by(stats.backpressure_count - seen);
        }
    }

    /// Records one job outcome.
    pub fn record_outcome(&self, outcome: &str) {
        self.jobs_processed_total.with_label_values(&[outcome]).inc();
    }

    /// Mirrors the breaker state.
    pub fn observe_circuit(&self, state: BreakerState) {
        let value = match state {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        };
        self.circuit_state.set(value);
    }

    /// Records fetch-cache hits since the last observation.
    pub fn observe_cache_hits(&self, total_hits: u64) {
        let seen = self.fetch_cache_hits_total.get();
        if total_hits > seen {
            self.fetch_cache_hits_total.inc_by(total_hits - seen);
        }
    }

    /// Mirrors the batcher's current target size.
    pub fn observe_batch_size(&self, size: usize) {
        self.batch_size.set(size as i64);
    }

    /// Renders the registry in the Prometheus text format.
    pub fn export_metrics(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Stage;
    use std::collections::HashMap;

    fn queue_stats() -> QueueStats {
        QueueStats {
            memory_occupancy: 3,
            memory_capacity: 100,
            ready: HashMap::from([(Stage::Fetch, 5), (Stage::Analyze, 2)]),
            in_flight: HashMap::new(),
            dead_letter: 1,
            backpressure_count: 4,
            expired_count: 0,
            enqueued_total: 10,
            acked_total: 7,
        }
    }

    #[test]
    fn test_export_contains_families() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.observe_queue(&queue_stats());
        metrics.record_outcome("queued_downstream");
        metrics.observe_circuit(BreakerState::Open);
        metrics.observe_batch_size(20);

        let text = metrics.export_metrics().unwrap();
        assert!(text.contains("jobflow_queue_depth{stage=\"fetch\"} 5"));
        assert!(text.contains("jobflow_backpressure_total 4"));
        assert!(text.contains("jobflow_jobs_processed_total{outcome=\"queued_downstream\"} 1"));
        assert!(text.contains("jobflow_circuit_state 2"));
        assert!(text.contains("jobflow_batch_size 20"));
    }

    #[test]
    fn test_backpressure_counter_is_monotonic() {
        let metrics = PipelineMetrics::new().unwrap();
        let mut stats = queue_stats();
        metrics.observe_queue(&stats);

        // A second observation of the same snapshot adds nothing.
        metrics.observe_queue(&stats);
        assert!(metrics.export_metrics().unwrap().contains("jobflow_backpressure_total 4"));

        stats.backpressure_count = 6;
        metrics.observe_queue(&stats);
        assert!(metrics.export_metrics().unwrap().contains("jobflow_backpressure_total 6"));
    }

    #[test]
    fn test_cache_hit_observation() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.observe_cache_hits(3);
        metrics.observe_cache_hits(3);
        metrics.observe_cache_hits(5);
        assert!(metrics
            .export_metrics()
            .unwrap()
            .contains("jobflow_fetch_cache_hits_total 5"));
    }
}
