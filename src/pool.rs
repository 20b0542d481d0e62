//! Rate-limited connection pool for outbound fetches.
//!
//! The pool bounds concurrent outbound requests with a semaphore,
//! paces them with a sliding-window rate limiter, and retries
//! transient failures with capped exponential backoff. Rate-limit
//! throttling delays the caller but never drops a request and is not
//! counted as a failure.
//!
//! A periodic health check validates the underlying client and
//! rebuilds it when broken; the pool reports a degraded health signal
//! once the observed error rate over the recent window exceeds the
//! configured threshold.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ErrorClass;

/// Throttle delays tolerated per request before giving up on a target
/// that keeps answering 429.
const MAX_THROTTLE_DELAYS: u32 = 10;

/// Errors from pool requests.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Transient failures exhausted the retry budget.
    #[error("request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The target rejected the request; not retried.
    #[error("request rejected with status {code}: {url}")]
    Rejected { code: u16, url: String },

    /// The pool could not build an HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl PoolError {
    /// Classifies the error for caller-side handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            PoolError::RetriesExhausted { .. } => ErrorClass::Transient,
            PoolError::Rejected { .. } => ErrorClass::Validation,
            PoolError::ClientBuild(_) => ErrorClass::Transient,
        }
    }
}

/// Configuration for the rate-limited pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent in-flight requests.
    pub pool_size: usize,
    /// Hard upper bound on concurrency; `pool_size` is clamped to it.
    pub max_pool_size: usize,
    /// Requests allowed per second.
    pub requests_per_second: u32,
    /// Rolling window tracked by the limiter and the health stats.
    pub window: Duration,
    /// Retry attempts per request for transient failures.
    pub max_attempts: u32,
    /// Initial retry delay; doubles per attempt.
    pub base_delay: Duration,
    /// Cap for retry and throttle backoff.
    pub max_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// How often the health check runs.
    pub health_check_interval: Duration,
    /// URL probed by the health check; skipped when absent.
    pub health_check_url: Option<String>,
    /// Error rate over the recent window above which health degrades.
    pub degraded_error_rate: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            max_pool_size: 32,
            requests_per_second: 5,
            window: Duration::from_secs(60),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            health_check_url: None,
            degraded_error_rate: 0.1,
        }
    }
}

/// Pool health as seen by external pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Error rate within bounds.
    Healthy,
    /// Error rate over the recent window exceeded the threshold.
    Degraded,
}

/// Sliding-window rate limiter over request timestamps.
///
/// `acquire` delays until a slot opens; it never drops. Repeated
/// throttling escalates the delay with capped exponential backoff.
pub struct SlidingWindowLimiter {
    timestamps: Mutex<VecDeque<Instant>>,
    requests_per_second: u32,
    window: Duration,
    max_delay: Duration,
    throttle_streak: AtomicU64,
    throttled_total: AtomicU64,
}

impl SlidingWindowLimiter {
    /// Creates a limiter with the given per-second cap and window.
    pub fn new(requests_per_second: u32, window: Duration, max_delay: Duration) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            requests_per_second,
            window,
            max_delay,
            throttle_streak: AtomicU64::new(0),
            throttled_total: AtomicU64::new(0),
        }
    }

    /// Waits until the limiter grants a slot, then records it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().expect("limiter lock poisoned");
                let now = Instant::now();
                while let Some(front) = timestamps.front() {
                    if now.duration_since(*front) > self.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }

                let one_second_ago = now - Duration::from_secs(1);
                let recent = timestamps
                    .iter()
                    .rev()
                    .take_while(|t| **t > one_second_ago)
                    .count();

                if recent < self.requests_per_second as usize {
                    timestamps.push_back(now);
                    self.throttle_streak.store(0, Ordering::SeqCst);
                    None
                } else {
                    // Wait for the oldest request of the last second to
                    // fall out of it.
                    let oldest_recent = timestamps
                        .iter()
                        .rev()
                        .take(self.requests_per_second as usize)
                        .last()
                        .copied();
                    let base_wait = oldest_recent
                        .map(|t| (t + Duration::from_secs(1)).saturating_duration_since(now))
                        .unwrap_or(Duration::from_millis(100));
                    Some(base_wait)
                }
            };

            match wait {
                None => return,
                Some(base_wait) => {
                    let streak = self.throttle_streak.fetch_add(1, Ordering::SeqCst);
                    self.throttled_total.fetch_add(1, Ordering::SeqCst);
                    // Sustained throttling escalates the delay.
                    let penalty = if streak >= 3 {
                        let exp = (streak - 2).min(16) as u32;
                        Duration::from_millis(250).saturating_mul(1u32 << exp)
                    } else {
                        Duration::ZERO
                    };
                    let delay = (base_wait + penalty).min(self.max_delay);
                    debug!(delay_ms = delay.as_millis() as u64, "Rate limiter throttling");
                    tokio::time::sleep(delay.max(Duration::from_millis(10))).await;
                }
            }
        }
    }

    /// Requests granted inside the current window.
    pub fn window_len(&self) -> usize {
        let timestamps = self.timestamps.lock().expect("limiter lock poisoned");
        let now = Instant::now();
        timestamps
            .iter()
            .filter(|t| now.duration_since(**t) <= self.window)
            .count()
    }

    /// Total throttle delays applied.
    pub fn throttled_total(&self) -> u64 {
        self.throttled_total.load(Ordering::SeqCst)
    }
}

/// One request outcome kept for the rolling health window.
struct Outcome {
    at: Instant,
    latency: Duration,
    success: bool,
}

/// Snapshot of pool state for external polling.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Configured concurrency bound.
    pub pool_size: usize,
    /// Requests currently in flight.
    pub active: usize,
    /// Total requests attempted.
    pub requests_total: u64,
    /// Requests granted inside the limiter window.
    pub window_requests: usize,
    /// Average latency over the recent window.
    pub average_latency: Duration,
    /// Error rate over the recent window (0.0 - 1.0).
    pub error_rate: f64,
    /// Transient failures observed.
    pub transient_errors: u64,
    /// Non-retryable rejections observed.
    pub validation_errors: u64,
    /// Throttle delays applied by the limiter.
    pub rate_limited_delays: u64,
    /// Current health signal.
    pub health: HealthStatus,
}

/// Rate-limited, retrying HTTP connection pool.
pub struct RateLimitedPool {
    config: PoolConfig,
    /// Effective concurrency: `pool_size` clamped to `max_pool_size`.
    size: usize,
    client: RwLock<reqwest::Client>,
    permits: Arc<Semaphore>,
    limiter: SlidingWindowLimiter,
    outcomes: Mutex<VecDeque<Outcome>>,
    requests_total: AtomicU64,
    transient_errors: AtomicU64,
    validation_errors: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RateLimitedPool {
    /// Creates a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let client = Self::build_client(&config)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let size = config.pool_size.min(config.max_pool_size).max(1);
        Ok(Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            limiter: SlidingWindowLimiter::new(
                config.requests_per_second,
                config.window,
                config.max_delay,
            ),
            client: RwLock::new(client),
            outcomes: Mutex::new(VecDeque::new()),
            requests_total: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
            config,
        })
    }

    fn build_client(config: &PoolConfig) -> Result<reqwest::Client, PoolError> {
        reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_size.min(config.max_pool_size).max(1))
            .build()
            .map_err(|e| PoolError::ClientBuild(e.to_string()))
    }

    /// Starts the periodic health check task.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.config.health_check_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => pool.run_health_check().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
        self.background
            .lock()
            .expect("background lock poisoned")
            .push(handle);
    }

    /// Stops the health check task.
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

    /// Performs a GET with rate limiting and transient-failure retry,
    /// returning the response body.
    pub async fn request(&self, url: &str) -> Result<String, PoolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("pool semaphore closed");

        let mut attempt: u32 = 0;
        let mut throttle_delays: u32 = 0;
        let mut last_error = String::new();

        while attempt < self.config.max_attempts {
            attempt += 1;
            self.limiter.acquire().await;
            self.requests_total.fetch_add(1, Ordering::SeqCst);

            let started = Instant::now();
            let client = self.client.read().await.clone();
            let result = client.get(url).send().await;
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.record_outcome(latency, true);
                        return response.text().await.map_err(|e| {
                            self.transient_errors.fetch_add(1, Ordering::SeqCst);
                            PoolError::RetriesExhausted {
                                attempts: attempt,
                                last_error: e.to_string(),
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        // Throttled by the target; delay, do not count
                        // as a failure or consume an attempt. A target
                        // that never stops answering 429 still gets a
                        // bounded number of delays.
                        throttle_delays += 1;
                        if throttle_delays >= MAX_THROTTLE_DELAYS {
                            self.record_outcome(latency, false);
                            self.transient_errors.fetch_add(1, Ordering::SeqCst);
                            return Err(PoolError::RetriesExhausted {
                                attempts: attempt,
                                last_error: format!(
                                    "target rate limited the request {} times",
                                    throttle_delays
                                ),
                            });
                        }
                        attempt -= 1;
                        let delay = retry_after(&response)
                            .unwrap_or(self.config.base_delay)
                            .min(self.config.max_delay);
                        warn!(url, delay_ms = delay.as_millis() as u64, "Target rate limited us");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if status.is_client_error() {
                        self.record_outcome(latency, false);
                        self.validation_errors.fetch_add(1, Ordering::SeqCst);
                        return Err(PoolError::Rejected {
                            code: status.as_u16(),
                            url: url.to_string(),
                        });
                    }

                    // 5xx: transient
                    self.record_outcome(latency, false);
                    self.transient_errors.fetch_add(1, Ordering::SeqCst);
                    last_error = format!("server error {}", status.as_u16());
                }
                Err(e) => {
                    self.record_outcome(latency, false);
                    self.transient_errors.fetch_add(1, Ordering::SeqCst);
                    last_error = e.to_string();
                }
            }

            if attempt < self.config.max_attempts {
                let delay = backoff_delay(self.config.base_delay, attempt, self.config.max_delay);
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                tokio::time::sleep(delay).await;
            }
        }

        Err(PoolError::RetriesExhausted {
            attempts: attempt,
            last_error,
        })
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> PoolStats {
        let (average_latency, error_rate) = self.window_summary();
        PoolStats {
            pool_size: self.size,
            active: self.size - self.permits.available_permits(),
            requests_total: self.requests_total.load(Ordering::SeqCst),
            window_requests: self.limiter.window_len(),
            average_latency,
            error_rate,
            transient_errors: self.transient_errors.load(Ordering::SeqCst),
            validation_errors: self.validation_errors.load(Ordering::SeqCst),
            rate_limited_delays: self.limiter.throttled_total(),
            health: if error_rate > self.config.degraded_error_rate {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
        }
    }

    /// Current health signal derived from the recent error rate.
    pub fn health(&self) -> HealthStatus {
        self.stats().health
    }

    fn record_outcome(&self, latency: Duration, success: bool) {
        let mut outcomes = self.outcomes.lock().expect("outcomes lock poisoned");
        let now = Instant::now();
        outcomes.push_back(Outcome {
            at: now,
            latency,
            success,
        });
        while let Some(front) = outcomes.front() {
            if now.duration_since(front.at) > self.config.window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_summary(&self) -> (Duration, f64) {
        let outcomes = self.outcomes.lock().expect("outcomes lock poisoned");
        if outcomes.is_empty() {
            return (Duration::ZERO, 0.0);
        }
        let total: Duration = outcomes.iter().map(|o| o.latency).sum();
        let failures = outcomes.iter().filter(|o| !o.success).count();
        (
            total / outcomes.len() as u32,
            failures as f64 / outcomes.len() as f64,
        )
    }

    async fn run_health_check(&self) {
        let Some(url) = self.config.health_check_url.clone() else {
            return;
        };

        let client = self.client.read().await.clone();
        let probe = client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match probe {
            Ok(response) if response.status().is_success() => {
                debug!("Pool health check passed");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "Pool health check got error status");
            }
            Err(e) => {
                warn!(error = %e, "Pool health check failed, rebuilding client");
                match Self::build_client(&self.config) {
                    Ok(fresh) => {
                        *self.client.write().await = fresh;
                        info!("Pool HTTP client rebuilt");
                    }
                    Err(build_err) => {
                        warn!(error = %build_err, "Failed to rebuild HTTP client");
                    }
                }
            }
        }

        if self.health() == HealthStatus::Degraded {
            warn!(
                error_rate = self.stats().error_rate,
                "Pool health degraded over recent window"
            );
        }
    }
}

/// Exponential backoff doubling per attempt, capped.
fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

/// Parses a Retry-After header given in seconds.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}
