//! Circuit breaker guarding the remote analyzer backend.
//!
//! Closed counts consecutive failures; at the threshold the circuit
//! opens and calls are short-circuited until the recovery timeout
//! elapses. The circuit then goes half-open and admits a bounded
//! number of probe calls: one success closes it, one failure reopens
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::AnalyzerError;

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_probes: 3,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
enum State {
    Closed { failure_count: u32 },
    Open { since: Instant },
    HalfOpen { probes_used: u32 },
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<State>,
    failures_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed { failure_count: 0 }),
            failures_total: AtomicU64::new(0),
        }
    }

    /// Admits or rejects a call. Open circuits transition to half-open
    /// once the recovery timeout has elapsed; half-open circuits admit
    /// up to the probe budget.
    pub fn check(&self) -> Result<(), AnalyzerError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.config.recovery_timeout {
                    info!("Circuit half-open, probing backend");
                    *state = State::HalfOpen { probes_used: 1 };
                    Ok(())
                } else {
                    Err(AnalyzerError::CircuitOpen)
                }
            }
            State::HalfOpen { probes_used } => {
                if *probes_used < self.config.half_open_max_probes {
                    *probes_used += 1;
                    Ok(())
                } else {
                    Err(AnalyzerError::CircuitOpen)
                }
            }
        }
    }

    /// Records a successful call. Closes a half-open circuit and
    /// resets the failure count.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &*state {
            State::HalfOpen { .. } => {
                info!("Circuit closed after successful probe");
                *state = State::Closed { failure_count: 0 };
            }
            State::Closed { .. } => {
                *state = State::Closed { failure_count: 0 };
            }
            State::Open { .. } => {}
        }
    }

    /// Records a failed call. Rate-limit responses must not be passed
    /// here; they carry no signal about backend health.
    pub fn record_failure(&self) {
        self.failures_total.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match &mut *state {
            State::Closed { failure_count } => {
                *failure_count += 1;
                if *failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = *failure_count,
                        "Circuit opened after consecutive failures"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!("Probe failed, circuit reopened");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Current state, for stats and metrics.
    pub fn state(&self) -> BreakerState {
        match &*self.state.lock().expect("breaker lock poisoned") {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures while closed; 0 otherwise.
    pub fn failure_count(&self) -> u32 {
        match &*self.state.lock().expect("breaker lock poisoned") {
            State::Closed { failure_count } => *failure_count,
            _ => 0,
        }
    }

    /// Failures recorded over the breaker's lifetime.
    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::SeqCst)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_probes: 3,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.check(), Err(AnalyzerError::CircuitOpen)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        assert_eq!(b.failure_count(), 0);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        assert!(b.check().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        // First admitted call is the first probe.
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Probe budget is 3 in total.
        assert!(b.check().is_ok());
        assert!(b.check().is_ok());
        assert!(matches!(b.check(), Err(AnalyzerError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        b.check().expect("probe admitted");
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        b.check().expect("probe admitted");
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());

        // A second recovery window earns another probe round.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(b.check().is_ok());
    }
}
