//! Memory-aware job batcher.
//!
//! Accumulates individual jobs and emits batches whose target size
//! adapts to process memory pressure. A background optimizer samples
//! memory usage on a fixed interval, tracks a short trend, shrinks the
//! target under pressure and grows it back when usage is comfortably
//! low.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::job::JobRecord;

/// How many samples the trend window keeps.
const TREND_WINDOW: usize = 3;

/// Batcher tuning knobs.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Smallest allowed target batch size.
    pub min_batch_size: usize,
    /// Largest allowed target batch size.
    pub max_batch_size: usize,
    /// Target size at startup.
    pub initial_batch_size: usize,
    /// How often the optimizer samples memory.
    pub sample_interval: Duration,
    /// Memory usage fraction considered "full".
    pub memory_threshold: f64,
    /// Shrink once usage exceeds threshold times this margin.
    pub safety_margin: f64,
    /// Multiplier applied when shrinking.
    pub shrink_factor: f64,
    /// Multiplier applied when growing.
    pub grow_factor: f64,
    /// Grow only below this usage fraction.
    pub grow_below: f64,
    /// Adjustments smaller than this many slots are ignored.
    pub min_adjust_delta: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 5,
            max_batch_size: 100,
            initial_batch_size: 20,
            sample_interval: Duration::from_secs(60),
            memory_threshold: 0.8,
            safety_margin: 0.8,
            shrink_factor: 0.7,
            grow_factor: 1.2,
            grow_below: 0.5,
            min_adjust_delta: 2,
        }
    }
}

/// Direction of memory usage over the trend window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Source of the process memory-usage reading.
///
/// Production uses [`ProcMemoryProbe`]; tests inject fixed readings.
pub trait MemoryProbe: Send + Sync {
    /// Fraction of total memory this process uses, 0.0 - 1.0.
    fn usage_fraction(&self) -> std::io::Result<f64>;
}

/// Reads resident set size from `/proc/self/statm` against the machine
/// total from `/proc/meminfo`.
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn usage_fraction(&self) -> std::io::Result<f64> {
        let statm = std::fs::read_to_string("/proc/self/statm")?;
        let resident_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed /proc/self/statm")
            })?;
        let resident_bytes = resident_pages * 4096;

        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let total_kb: u64 = meminfo
            .lines()
            .find(|l| l.starts_with("MemTotal:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed /proc/meminfo")
            })?;

        if total_kb == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "zero MemTotal",
            ));
        }

        Ok((resident_bytes as f64 / (total_kb as f64 * 1024.0)).clamp(0.0, 1.0))
    }
}

/// Snapshot of batcher state for external polling.
#[derive(Debug, Clone)]
pub struct BatcherStats {
    /// Current target batch size.
    pub current_batch_size: usize,
    /// Jobs buffered, not yet emitted.
    pub buffered: usize,
    /// Most recent memory sample, if any.
    pub last_sample: Option<f64>,
    /// Trend over the sample window.
    pub trend: MemoryTrend,
    /// Times the target shrank.
    pub shrink_count: u64,
    /// Times the target grew.
    pub grow_count: u64,
    /// Batches emitted so far.
    pub batches_emitted: u64,
}

struct BatchInner {
    buffer: Vec<JobRecord>,
    current_batch_size: usize,
    samples: VecDeque<f64>,
    shrink_count: u64,
    grow_count: u64,
    batches_emitted: u64,
}

/// Accumulates jobs into memory-pressure-sized batches.
pub struct JobBatcher {
    config: BatcherConfig,
    probe: Arc<dyn MemoryProbe>,
    inner: Mutex<BatchInner>,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl JobBatcher {
    /// Creates a batcher with the given probe.
    pub fn new(config: BatcherConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let initial = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            probe,
            inner: Mutex::new(BatchInner {
                buffer: Vec::new(),
                current_batch_size: initial,
                samples: VecDeque::with_capacity(TREND_WINDOW),
                shrink_count: 0,
                grow_count: 0,
                batches_emitted: 0,
            }),
            shutdown_tx,
            background: Mutex::new(None),
            config,
        }
    }

    /// Creates a batcher backed by the `/proc` probe.
    pub fn with_proc_probe(config: BatcherConfig) -> Self {
        Self::new(config, Arc::new(ProcMemoryProbe))
    }

    /// Appends a job; returns a full batch once the buffer reaches the
    /// current target size.
    pub fn add(&self, job: JobRecord) -> Option<Vec<JobRecord>> {
        let mut inner = self.inner.lock().expect("batcher lock poisoned");
        inner.buffer.push(job);
        if inner.buffer.len() >= inner.current_batch_size {
            let batch = std::mem::take(&mut inner.buffer);
            inner.batches_emitted += 1;
            debug!(batch_size = batch.len(), "Batch ready");
            Some(batch)
        } else {
            None
        }
    }

    /// Emits whatever is buffered, regardless of target size.
    pub fn flush(&self) -> Vec<JobRecord> {
        let mut inner = self.inner.lock().expect("batcher lock poisoned");
        if inner.buffer.is_empty() {
            return Vec::new();
        }
        let batch = std::mem::take(&mut inner.buffer);
        inner.batches_emitted += 1;
        batch
    }

    /// Starts the background memory optimizer.
    pub fn start(self: &Arc<Self>) {
        let batcher = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(batcher.config.sample_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => batcher.sample_and_adjust(),
                    _ = shutdown.recv() => break,
                }
            }
        });
        *self.background.lock().expect("background lock poisoned") = Some(handle);
    }

    /// Stops the optimizer task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self
            .background
            .lock()
            .expect("background lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> BatcherStats {
        let inner = self.inner.lock().expect("batcher lock poisoned");
        BatcherStats {
            current_batch_size: inner.current_batch_size,
            buffered: inner.buffer.len(),
            last_sample: inner.samples.back().copied(),
            trend: trend_of(&inner.samples),
            shrink_count: inner.shrink_count,
            grow_count: inner.grow_count,
            batches_emitted: inner.batches_emitted,
        }
    }

    fn sample_and_adjust(&self) {
        match self.probe.usage_fraction() {
            Ok(usage) => self.record_sample(usage),
            Err(e) => warn!(error = %e, "Memory probe failed, skipping adjustment"),
        }
    }

    /// Records a memory sample and applies the sizing policy. One
    /// optimization cycle; also the test entry point.
    pub fn record_sample(&self, usage: f64) {
        let mut inner = self.inner.lock().expect("batcher lock poisoned");
        if inner.samples.len() == TREND_WINDOW {
            inner.samples.pop_front();
        }
        inner.samples.push_back(usage);
        let trend = trend_of(&inner.samples);

        let shrink_point = self.config.memory_threshold * self.config.safety_margin;
        let current = inner.current_batch_size;

        let target = if usage > shrink_point {
            (current as f64 * self.config.shrink_factor).round() as usize
        } else if usage < self.config.grow_below && trend != MemoryTrend::Increasing {
            (current as f64 * self.config.grow_factor).round() as usize
        } else {
            current
        };

        // Ignore sub-delta adjustments so the target does not thrash,
        // but always allow clamping to land exactly on the bounds.
        if target.abs_diff(current) < self.config.min_adjust_delta {
            return;
        }

        let clamped = target.clamp(self.config.min_batch_size, self.config.max_batch_size);
        if clamped == current {
            return;
        }

        if clamped < current {
            inner.shrink_count += 1;
            info!(
                usage = format!("{:.2}", usage),
                from = current,
                to = clamped,
                "Shrinking batch size under memory pressure"
            );
        } else {
            inner.grow_count += 1;
            debug!(
                usage = format!("{:.2}", usage),
                from = current,
                to = clamped,
                "Growing batch size"
            );
        }
        inner.current_batch_size = clamped;
    }
}

fn trend_of(samples: &VecDeque<f64>) -> MemoryTrend {
    if samples.len() < TREND_WINDOW {
        return MemoryTrend::Stable;
    }
    const EPSILON: f64 = 0.005;
    let increasing = samples
        .iter()
        .zip(samples.iter().skip(1))
        .all(|(a, b)| b - a > EPSILON);
    let decreasing = samples
        .iter()
        .zip(samples.iter().skip(1))
        .all(|(a, b)| a - b > EPSILON);
    if increasing {
        MemoryTrend::Increasing
    } else if decreasing {
        MemoryTrend::Decreasing
    } else {
        MemoryTrend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;

    struct FixedProbe(f64);

    impl MemoryProbe for FixedProbe {
        fn usage_fraction(&self) -> std::io::Result<f64> {
            Ok(self.0)
        }
    }

    fn job(id: &str) -> JobRecord {
        JobRecord::new(id, "http://example.com/job", "Engineer", "Acme", "Remote")
    }

    fn batcher(config: BatcherConfig) -> JobBatcher {
        JobBatcher::new(config, Arc::new(FixedProbe(0.3)))
    }

    #[test]
    fn test_add_emits_batch_at_target_size() {
        let b = batcher(BatcherConfig {
            initial_batch_size: 5,
            ..Default::default()
        });

        for i in 0..4 {
            assert!(b.add(job(&format!("j{}", i))).is_none());
        }
        let batch = b.add(job("j4")).expect("batch ready");
        assert_eq!(batch.len(), 5);
        assert_eq!(b.stats().buffered, 0);
    }

    #[test]
    fn test_flush_emits_partial_batch() {
        let b = batcher(BatcherConfig::default());
        b.add(job("j0"));
        b.add(job("j1"));

        let batch = b.flush();
        assert_eq!(batch.len(), 2);
        assert!(b.flush().is_empty());
        assert_eq!(b.stats().batches_emitted, 1);
    }

    #[test]
    fn test_shrinks_monotonically_to_min_under_pressure() {
        let b = batcher(BatcherConfig::default());
        // 90% of the threshold: above threshold * margin (0.64).
        let usage = 0.8 * 0.9;

        let mut last = b.stats().current_batch_size;
        for _ in 0..10 {
            b.record_sample(usage);
            let size = b.stats().current_batch_size;
            assert!(size <= last, "size must not grow under pressure");
            last = size;
        }
        assert_eq!(last, 5);

        // Never drops below the floor.
        b.record_sample(usage);
        assert_eq!(b.stats().current_batch_size, 5);
    }

    #[test]
    fn test_grows_when_usage_low_and_not_increasing() {
        let b = batcher(BatcherConfig::default());
        b.record_sample(0.3);
        assert_eq!(b.stats().current_batch_size, 24);
        assert_eq!(b.stats().grow_count, 1);
    }

    #[test]
    fn test_growth_suppressed_while_trending_up() {
        let b = batcher(BatcherConfig::default());
        b.record_sample(0.10);
        b.record_sample(0.20);
        // Third sample completes an increasing window; usage is still
        // low but the trend blocks growth.
        let before = b.stats().current_batch_size;
        b.record_sample(0.30);
        // First two samples grew the target before the window filled.
        assert_eq!(b.stats().current_batch_size, before);
        assert_eq!(b.stats().trend, MemoryTrend::Increasing);
    }

    #[test]
    fn test_small_adjustments_ignored() {
        let b = batcher(BatcherConfig {
            initial_batch_size: 6,
            min_adjust_delta: 2,
            ..Default::default()
        });
        // 6 * 1.2 = 7.2 -> 7, delta 1 < 2: ignored.
        b.record_sample(0.3);
        assert_eq!(b.stats().current_batch_size, 6);
        assert_eq!(b.stats().grow_count, 0);
    }

    #[test]
    fn test_growth_capped_at_max() {
        let b = batcher(BatcherConfig {
            initial_batch_size: 95,
            ..Default::default()
        });
        b.record_sample(0.2);
        assert_eq!(b.stats().current_batch_size, 100);
        b.record_sample(0.2);
        assert_eq!(b.stats().current_batch_size, 100);
    }

    #[test]
    fn test_trend_detection() {
        let mut samples = VecDeque::new();
        samples.extend([0.1, 0.2, 0.3]);
        assert_eq!(trend_of(&samples), MemoryTrend::Increasing);

        let mut samples = VecDeque::new();
        samples.extend([0.5, 0.4, 0.3]);
        assert_eq!(trend_of(&samples), MemoryTrend::Decreasing);

        let mut samples = VecDeque::new();
        samples.extend([0.3, 0.5, 0.4]);
        assert_eq!(trend_of(&samples), MemoryTrend::Stable);

        let mut samples = VecDeque::new();
        samples.extend([0.1, 0.2]);
        assert_eq!(trend_of(&samples), MemoryTrend::Stable);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_probe_reads_sane_fraction() {
        let usage = ProcMemoryProbe.usage_fraction().expect("probe");
        assert!((0.0..=1.0).contains(&usage));
    }
}
