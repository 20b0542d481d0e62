//! Deterministic local analyzer.
//!
//! Scores a job by keyword overlap between the candidate's skills and
//! the job's extracted keywords plus description text. A stand-in for
//! real scoring heuristics; its value is that it always gives the same
//! answer for the same input and needs no network.

use std::collections::BTreeSet;

use async_trait::async_trait;
use regex::Regex;

use crate::error::AnalyzerError;
use crate::job::JobRecord;

use super::{AnalysisResult, Analyzer, CandidateProfile, Recommendation};

/// Fixed confidence reported for rule-based results.
const RULE_CONFIDENCE: f64 = 0.6;

/// Local keyword-overlap analyzer.
pub struct RuleBasedAnalyzer {
    token: Regex,
}

impl RuleBasedAnalyzer {
    pub fn new() -> Self {
        Self {
            token: Regex::new(r"[A-Za-z][A-Za-z+#.]{1,}").expect("valid token regex"),
        }
    }

    fn job_terms(&self, job: &JobRecord) -> BTreeSet<String> {
        let mut terms: BTreeSet<String> = job.keywords.iter().map(|k| k.to_lowercase()).collect();
        let text = format!(
            "{} {}",
            job.title,
            job.description.as_deref().unwrap_or("")
        );
        terms.extend(
            self.token
                .find_iter(&text)
                .map(|m| m.as_str().to_lowercase()),
        );
        terms
    }
}

impl Default for RuleBasedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for RuleBasedAnalyzer {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    async fn analyze(
        &self,
        job: &JobRecord,
        profile: &CandidateProfile,
    ) -> Result<AnalysisResult, AnalyzerError> {
        if profile.skills.is_empty() {
            return Err(AnalyzerError::LocalFailed(
                "candidate profile has no skills to match".to_string(),
            ));
        }

        let terms = self.job_terms(job);
        let mut matches = Vec::new();
        let mut gaps = Vec::new();
        for skill in &profile.skills {
            if terms.contains(&skill.to_lowercase()) {
                matches.push(skill.clone());
            } else {
                gaps.push(skill.clone());
            }
        }

        let score = matches.len() as f64 / profile.skills.len() as f64;
        let recommendation = if score >= 0.7 {
            Recommendation::Apply
        } else if score >= 0.4 {
            Recommendation::Consider
        } else {
            Recommendation::Skip
        };

        Ok(AnalysisResult {
            compatibility_score: score,
            confidence: RULE_CONFIDENCE,
            reasoning: format!(
                "matched {} of {} profile skills by keyword overlap",
                matches.len(),
                profile.skills.len()
            ),
            skill_matches: matches,
            skill_gaps: gaps,
            recommendation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(description: &str, keywords: &[&str]) -> JobRecord {
        let mut job = JobRecord::new("j1", "http://example.com/j1", "Engineer", "Acme", "Remote");
        job.description = Some(description.to_string());
        job.keywords = keywords.iter().map(|k| k.to_string()).collect();
        job
    }

    fn profile(skills: &[&str]) -> CandidateProfile {
        CandidateProfile {
            skills: skills.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_overlap_recommends_apply() {
        let analyzer = RuleBasedAnalyzer::new();
        let job = job_with("We build services in Rust on Kubernetes", &["rust"]);
        let result = analyzer
            .analyze(&job, &profile(&["rust", "kubernetes"]))
            .await
            .unwrap();

        assert_eq!(result.compatibility_score, 1.0);
        assert_eq!(result.recommendation, Recommendation::Apply);
        assert_eq!(result.skill_matches.len(), 2);
        assert!(result.skill_gaps.is_empty());
    }

    #[tokio::test]
    async fn test_partial_overlap_scores_fraction() {
        let analyzer = RuleBasedAnalyzer::new();
        let job = job_with("Python data pipelines", &[]);
        let result = analyzer
            .analyze(&job, &profile(&["python", "rust"]))
            .await
            .unwrap();

        assert_eq!(result.compatibility_score, 0.5);
        assert_eq!(result.recommendation, Recommendation::Consider);
        assert_eq!(result.skill_gaps, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn test_no_overlap_recommends_skip() {
        let analyzer = RuleBasedAnalyzer::new();
        let job = job_with("Enterprise sales role", &[]);
        let result = analyzer.analyze(&job, &profile(&["rust"])).await.unwrap();

        assert_eq!(result.compatibility_score, 0.0);
        assert_eq!(result.recommendation, Recommendation::Skip);
    }

    #[tokio::test]
    async fn test_deterministic_across_calls() {
        let analyzer = RuleBasedAnalyzer::new();
        let job = job_with("Rust and Go services", &["docker"]);
        let p = profile(&["rust", "go", "docker", "java"]);

        let a = analyzer.analyze(&job, &p).await.unwrap();
        let b = analyzer.analyze(&job, &p).await.unwrap();
        assert_eq!(a.compatibility_score, b.compatibility_score);
        assert_eq!(a.skill_matches, b.skill_matches);
    }

    #[tokio::test]
    async fn test_empty_profile_fails() {
        let analyzer = RuleBasedAnalyzer::new();
        let job = job_with("Rust", &[]);
        let err = analyzer
            .analyze(&job, &CandidateProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::LocalFailed(_)));
    }
}
