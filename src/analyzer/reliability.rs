//! The reliability layer: breaker + retry + fallback chain.
//!
//! `ReliableAnalyzer::analyze` never fails. It tries the remote
//! backend (each attempt gated by the circuit breaker, transient
//! failures retried with backoff), falls back to the local rule-based
//! analyzer, and finally to a fixed neutral result. The caller always
//! learns which method produced the answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ErrorClass;
use crate::job::{AnalysisMethod, JobRecord};

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use super::retry::RetryPolicy;
use super::{AnalysisResult, Analyzer, CandidateProfile};

/// Counters for how analyses were served.
#[derive(Debug, Clone, Default)]
pub struct ReliabilityStats {
    /// Analyses answered by the remote backend.
    pub ai_served: u64,
    /// Analyses answered by the rule-based fallback.
    pub rule_based_served: u64,
    /// Analyses answered by the neutral default.
    pub fallback_served: u64,
    /// Calls short-circuited by the open breaker.
    pub short_circuited: u64,
    /// Breaker failures recorded over the lifetime.
    pub breaker_failures: u64,
    /// Current breaker state.
    pub breaker_state: BreakerState,
}

/// Infallible analyzer chain.
pub struct ReliableAnalyzer {
    remote: Arc<dyn Analyzer>,
    rules: Arc<dyn Analyzer>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    ai_served: AtomicU64,
    rule_based_served: AtomicU64,
    fallback_served: AtomicU64,
    short_circuited: AtomicU64,
}

impl ReliableAnalyzer {
    /// Builds the chain with default breaker and retry settings.
    pub fn new(remote: Arc<dyn Analyzer>, rules: Arc<dyn Analyzer>) -> Self {
        Self::with_policies(remote, rules, BreakerConfig::default(), RetryPolicy::default())
    }

    pub fn with_policies(
        remote: Arc<dyn Analyzer>,
        rules: Arc<dyn Analyzer>,
        breaker: BreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            rules,
            breaker: CircuitBreaker::new(breaker),
            retry,
            ai_served: AtomicU64::new(0),
            rule_based_served: AtomicU64::new(0),
            fallback_served: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    /// Analyzes a job, always producing a result and the method that
    /// produced it.
    pub async fn analyze(
        &self,
        job: &JobRecord,
        profile: &CandidateProfile,
    ) -> (AnalysisResult, AnalysisMethod) {
        match self.analyze_remote(job, profile).await {
            Ok(result) => {
                self.ai_served.fetch_add(1, Ordering::SeqCst);
                return (result, AnalysisMethod::Ai);
            }
            Err(e) => {
                if e.class() == ErrorClass::CircuitOpen {
                    self.short_circuited.fetch_add(1, Ordering::SeqCst);
                }
                warn!(job_id = %job.id, error = %e, "Remote analysis failed, falling back");
            }
        }

        match self.rules.analyze(job, profile).await {
            Ok(result) => {
                self.rule_based_served.fetch_add(1, Ordering::SeqCst);
                (result.clamped(), AnalysisMethod::RuleBased)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Rule-based analysis failed, using neutral default");
                self.fallback_served.fetch_add(1, Ordering::SeqCst);
                (AnalysisResult::neutral(), AnalysisMethod::Fallback)
            }
        }
    }

    /// One remote analysis with retry; every attempt is gated by the
    /// breaker and reported back to it. Rate-limit responses are
    /// delayed by the retry policy but carry no breaker signal.
    async fn analyze_remote(
        &self,
        job: &JobRecord,
        profile: &CandidateProfile,
    ) -> Result<AnalysisResult, crate::error::AnalyzerError> {
        self.retry
            .run(|| async {
                self.breaker.check()?;
                match self.remote.analyze(job, profile).await {
                    Ok(result) => {
                        self.breaker.record_success();
                        Ok(result.clamped())
                    }
                    Err(e) => {
                        if e.class() != ErrorClass::RateLimited {
                            self.breaker.record_failure();
                        }
                        debug!(job_id = %job.id, class = %e.class(), "Remote attempt failed");
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Current breaker state.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Breaker handle, for tests and stats wiring.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> ReliabilityStats {
        ReliabilityStats {
            ai_served: self.ai_served.load(Ordering::SeqCst),
            rule_based_served: self.rule_based_served.load(Ordering::SeqCst),
            fallback_served: self.fallback_served.load(Ordering::SeqCst),
            short_circuited: self.short_circuited.load(Ordering::SeqCst),
            breaker_failures: self.breaker.failures_total(),
            breaker_state: self.breaker.state(),
        }
    }
}
