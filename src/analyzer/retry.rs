//! Retry policy for remote analyzer calls.
//!
//! Retries only failures classified as retryable, with exponential
//! backoff, jitter and a delay cap. Rate-limit responses honor the
//! backend's Retry-After hint when one is given.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, warn};

use crate::error::AnalyzerError;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Jitter fraction applied to each delay (0.25 = +/-25%).
    pub jitter: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.25,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Jittered backoff delay before the attempt after `attempt`
    /// (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
            (capped * factor).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Runs `op` until it succeeds, fails non-retryably, or the
    /// attempt budget runs out. Returns the last error in that case.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, AnalyzerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AnalyzerError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.delay_for(attempt))
                        .min(self.max_delay);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying analyzer call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt >= self.max_attempts && e.is_retryable() {
                        warn!(attempt, error = %e, "Analyzer retry budget exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
