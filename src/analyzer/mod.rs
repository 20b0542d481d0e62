//! Analyzer backends and the reliability layer around them.
//!
//! [`Analyzer`] is the seam: the remote HTTP backend, the local
//! rule-based scorer and test mocks all implement it. The
//! [`reliability`] module composes them into an infallible chain with
//! a circuit breaker and retry policy in front of the remote backend.

pub mod breaker;
pub mod reliability;
pub mod remote;
pub mod retry;
pub mod rules;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AnalyzerError;
use crate::job::JobRecord;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use reliability::{ReliabilityStats, ReliableAnalyzer};
pub use remote::{RemoteAnalyzer, RemoteConfig};
pub use retry::RetryPolicy;
pub use rules::RuleBasedAnalyzer;

/// What the analyzer recommends doing with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Apply,
    Consider,
    Skip,
}

/// The candidate the analyzer scores jobs against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateProfile {
    /// Skills used for compatibility matching.
    pub skills: BTreeSet<String>,
    /// Titles the candidate is looking for.
    #[serde(default)]
    pub preferred_titles: Vec<String>,
    /// Free-text summary passed through to the remote backend.
    #[serde(default)]
    pub summary: Option<String>,
}

/// Outcome of analyzing one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Compatibility in 0.0 - 1.0.
    pub compatibility_score: f64,
    /// Backend confidence in its own score, 0.0 - 1.0.
    pub confidence: f64,
    /// Profile skills found in the job.
    #[serde(default)]
    pub skill_matches: Vec<String>,
    /// Profile skills the job does not mention.
    #[serde(default)]
    pub skill_gaps: Vec<String>,
    pub recommendation: Recommendation,
    #[serde(default)]
    pub reasoning: String,
}

impl AnalysisResult {
    /// The fixed result used when every analyzer backend is down.
    pub fn neutral() -> Self {
        Self {
            compatibility_score: 0.5,
            confidence: 0.0,
            skill_matches: Vec::new(),
            skill_gaps: Vec::new(),
            recommendation: Recommendation::Consider,
            reasoning: "analysis unavailable, neutral default applied".to_string(),
        }
    }

    /// Clamps scores into range; remote backends are not trusted to.
    pub fn clamped(mut self) -> Self {
        self.compatibility_score = self.compatibility_score.clamp(0.0, 1.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// A compatibility-scoring backend.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Scores a job against the candidate profile.
    async fn analyze(
        &self,
        job: &JobRecord,
        profile: &CandidateProfile,
    ) -> Result<AnalysisResult, AnalyzerError>;
}
