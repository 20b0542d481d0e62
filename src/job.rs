//! Core job types for the enrichment pipeline.
//!
//! This module defines the unit of work flowing through the pipeline:
//!
//! - `JobRecord`: a job posting being enriched, with its state machine
//! - `JobStatus`: the per-record lifecycle states
//! - `QueueItem`: the envelope a record travels in between stages
//! - `DeadLetterItem`: terminal record for items that exhausted retries

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum number of delivery attempts before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for queue items (0 is normal priority).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Error returned when a state transition violates the lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition from '{from}' to '{to}'")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Lifecycle states of a job record.
///
/// Transitions are monotonic forward, with one explicit recovery edge:
/// `NeedsProcessing -> FetchingDescription`, re-triggered only by the
/// re-verification sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Produced by the upstream collector; description not yet fetched.
    Scraped,
    /// A fetch worker currently owns the record.
    FetchingDescription,
    /// Description fetched and extracted; awaiting analysis.
    DescriptionSaved,
    /// An analysis worker currently owns the record.
    Analyzing,
    /// Analysis produced a usable score.
    Analyzed,
    /// Recoverable terminal; a re-verification sweep may pick it up again.
    NeedsProcessing,
    /// Terminal; the record was dead-lettered.
    Failed,
    /// Terminal; the record qualified and is available to the action stage.
    QueuedForDownstream,
}

impl JobStatus {
    /// Returns whether `next` is a legal transition from this state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Scraped, FetchingDescription)
                | (FetchingDescription, DescriptionSaved)
                | (FetchingDescription, Failed)
                | (DescriptionSaved, Analyzing)
                | (Analyzing, Analyzed)
                | (Analyzing, NeedsProcessing)
                | (Analyzing, Failed)
                | (Analyzed, QueuedForDownstream)
                | (NeedsProcessing, FetchingDescription)
        )
    }

    /// Returns whether this state is terminal.
    ///
    /// `NeedsProcessing` is recoverable and therefore not terminal here.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::QueuedForDownstream)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scraped => "scraped",
            JobStatus::FetchingDescription => "fetching_description",
            JobStatus::DescriptionSaved => "description_saved",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Analyzed => "analyzed",
            JobStatus::NeedsProcessing => "needs_processing",
            JobStatus::Failed => "failed",
            JobStatus::QueuedForDownstream => "queued_for_downstream",
        };
        write!(f, "{}", s)
    }
}

/// How a compatibility score was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    /// The remote analyzer backend responded.
    Ai,
    /// The deterministic local analyzer was used.
    RuleBased,
    /// The fixed neutral default; the local analyzer also failed.
    Fallback,
}

impl std::fmt::Display for AnalysisMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisMethod::Ai => write!(f, "ai"),
            AnalysisMethod::RuleBased => write!(f, "rule_based"),
            AnalysisMethod::Fallback => write!(f, "fallback"),
        }
    }
}

/// A job posting being enriched by the pipeline.
///
/// The record is owned exclusively by whichever orchestrator holds it
/// off the queue; ownership transfers at dequeue/enqueue boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable identifier assigned by the collector.
    pub id: String,
    /// URL of the posting; key for the content cache.
    pub source_url: String,
    /// Job title.
    pub title: String,
    /// Hiring company.
    pub company: String,
    /// Location string as scraped.
    pub location: String,
    /// Full description; absent until the fetch stage populates it.
    #[serde(default)]
    pub description: Option<String>,
    /// Salary text if the posting carries one.
    #[serde(default)]
    pub salary: Option<String>,
    /// Keywords extracted from the posting.
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Compatibility score in [0.0, 1.0]; absent until analyzed.
    #[serde(default)]
    pub compatibility_score: Option<f64>,
    /// How the score was produced.
    #[serde(default)]
    pub analysis_method: Option<AnalysisMethod>,
    /// Total processing attempts across stages.
    pub attempt_count: u32,
    /// Last error observed while processing this record.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the record first entered the pipeline.
    pub enqueued_at: DateTime<Utc>,
    /// When the record last changed.
    pub last_updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a new record from collector-produced stub fields.
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_url: source_url.into(),
            title: title.into(),
            company: company.into(),
            location: location.into(),
            description: None,
            salary: None,
            keywords: BTreeSet::new(),
            status: JobStatus::Scraped,
            compatibility_score: None,
            analysis_method: None,
            attempt_count: 0,
            last_error: None,
            enqueued_at: now,
            last_updated_at: now,
        }
    }

    /// Sets the salary text.
    pub fn with_salary(mut self, salary: impl Into<String>) -> Self {
        self.salary = Some(salary.into());
        self
    }

    /// Adds keywords to the record.
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Advances the record to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.last_updated_at = Utc::now();
        Ok(())
    }

    /// Records an error message and bumps the update timestamp.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.last_updated_at = Utc::now();
    }

    /// Stores an analysis outcome on the record.
    pub fn record_analysis(&mut self, score: f64, method: AnalysisMethod) {
        self.compatibility_score = Some(score.clamp(0.0, 1.0));
        self.analysis_method = Some(method);
        self.last_updated_at = Utc::now();
    }

    /// Number of required fields (title, company, description) missing.
    ///
    /// Used by the analysis routing decision: records missing two or more
    /// required fields are failed rather than left recoverable.
    pub fn missing_required_fields(&self) -> usize {
        let mut missing = 0;
        if self.title.trim().is_empty() {
            missing += 1;
        }
        if self.company.trim().is_empty() {
            missing += 1;
        }
        if self.description.as_deref().map_or(true, |d| d.trim().is_empty()) {
            missing += 1;
        }
        missing
    }

    /// Checks the status/field consistency invariant.
    ///
    /// `DescriptionSaved` and later states require a description;
    /// `Analyzed` and its successors additionally require a score.
    pub fn invariants_hold(&self) -> bool {
        use JobStatus::*;
        let needs_description = matches!(
            self.status,
            DescriptionSaved | Analyzing | Analyzed | QueuedForDownstream
        );
        if needs_description && self.description.is_none() {
            return false;
        }
        let needs_score = matches!(self.status, Analyzed | QueuedForDownstream);
        if needs_score && (self.compatibility_score.is_none() || self.analysis_method.is_none()) {
            return false;
        }
        if let Some(score) = self.compatibility_score {
            if !(0.0..=1.0).contains(&score) {
                return false;
            }
        }
        true
    }
}

/// Pipeline stage a queue item is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Description fetch stage.
    Fetch,
    /// Analysis stage.
    Analyze,
    /// Hand-off to the out-of-scope action stage.
    Downstream,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Fetch, Stage::Analyze, Stage::Downstream];

    /// Stage tag used as the durable-store key suffix.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Analyze => "analyze",
            Stage::Downstream => "downstream",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Envelope wrapping a `JobRecord` while it sits on a queue stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// The wrapped record.
    pub job: JobRecord,
    /// Higher values are served first; ties break FIFO by `enqueued_at`.
    pub priority: i32,
    /// When this envelope was created.
    pub enqueued_at: DateTime<Utc>,
    /// Stage this item is addressed to.
    pub stage: Stage,
    /// Delivery attempts for this envelope.
    pub attempt: u32,
}

impl QueueItem {
    /// Creates a new envelope at default priority.
    pub fn new(job: JobRecord, stage: Stage) -> Self {
        Self::with_priority(job, stage, DEFAULT_PRIORITY)
    }

    /// Creates a new envelope with an explicit priority.
    pub fn with_priority(job: JobRecord, stage: Stage, priority: i32) -> Self {
        Self {
            job,
            priority,
            enqueued_at: Utc::now(),
            stage,
            attempt: 0,
        }
    }

    /// Increments the delivery attempt counter.
    pub fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Whether another delivery is allowed under `max_attempts`.
    pub fn should_retry(&self, max_attempts: u32) -> bool {
        self.attempt < max_attempts
    }

    /// How long this envelope has been queued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Terminal entry for an item that exhausted retries.
///
/// Dead-lettered items require manual inspection; the pipeline never
/// picks them up again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    /// The envelope as it was when dead-lettered.
    pub item: QueueItem,
    /// Why the item was dead-lettered (e.g. "fetch-failed", "expired").
    pub reason: String,
    /// When the item was moved.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterItem {
    /// Creates a dead-letter entry with the current timestamp.
    pub fn new(item: QueueItem, reason: impl Into<String>) -> Self {
        Self {
            item,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new("j1", "http://example.com/j1", "Engineer", "Acme", "Remote")
    }

    #[test]
    fn test_new_record_defaults() {
        let job = record();
        assert_eq!(job.status, JobStatus::Scraped);
        assert!(job.description.is_none());
        assert!(job.compatibility_score.is_none());
        assert_eq!(job.attempt_count, 0);
        assert!(job.invariants_hold());
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = record();
        job.advance(JobStatus::FetchingDescription).unwrap();
        job.description = Some("desc".to_string());
        job.advance(JobStatus::DescriptionSaved).unwrap();
        job.advance(JobStatus::Analyzing).unwrap();
        job.record_analysis(0.8, AnalysisMethod::Ai);
        job.advance(JobStatus::Analyzed).unwrap();
        job.advance(JobStatus::QueuedForDownstream).unwrap();
        assert!(job.status.is_terminal());
        assert!(job.invariants_hold());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut job = record();
        let err = job.advance(JobStatus::Analyzed).unwrap_err();
        assert_eq!(err.from, JobStatus::Scraped);
        assert_eq!(err.to, JobStatus::Analyzed);
        // State is unchanged after a rejected transition
        assert_eq!(job.status, JobStatus::Scraped);
    }

    #[test]
    fn test_recovery_edge() {
        let mut job = record();
        job.advance(JobStatus::FetchingDescription).unwrap();
        job.description = Some("desc".to_string());
        job.advance(JobStatus::DescriptionSaved).unwrap();
        job.advance(JobStatus::Analyzing).unwrap();
        job.advance(JobStatus::NeedsProcessing).unwrap();
        assert!(!job.status.is_terminal());
        // The sweep may re-trigger the fetch stage
        job.advance(JobStatus::FetchingDescription).unwrap();
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in [JobStatus::Failed, JobStatus::QueuedForDownstream] {
            for next in [
                JobStatus::Scraped,
                JobStatus::FetchingDescription,
                JobStatus::DescriptionSaved,
                JobStatus::Analyzing,
                JobStatus::Analyzed,
                JobStatus::NeedsProcessing,
                JobStatus::Failed,
                JobStatus::QueuedForDownstream,
            ] {
                assert!(!status.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_invariants_catch_missing_fields() {
        let mut job = record();
        job.status = JobStatus::DescriptionSaved;
        assert!(!job.invariants_hold());

        job.description = Some("desc".to_string());
        assert!(job.invariants_hold());

        job.status = JobStatus::Analyzed;
        assert!(!job.invariants_hold());

        job.record_analysis(0.5, AnalysisMethod::RuleBased);
        assert!(job.invariants_hold());
    }

    #[test]
    fn test_score_is_clamped() {
        let mut job = record();
        job.record_analysis(1.7, AnalysisMethod::Ai);
        assert_eq!(job.compatibility_score, Some(1.0));
        job.record_analysis(-0.2, AnalysisMethod::Ai);
        assert_eq!(job.compatibility_score, Some(0.0));
    }

    #[test]
    fn test_missing_required_fields() {
        let mut job = record();
        assert_eq!(job.missing_required_fields(), 1); // no description yet

        job.description = Some("desc".to_string());
        assert_eq!(job.missing_required_fields(), 0);

        job.title = String::new();
        job.company = "  ".to_string();
        assert_eq!(job.missing_required_fields(), 2);
    }

    #[test]
    fn test_queue_item_retry_budget() {
        let mut item = QueueItem::new(record(), Stage::Fetch);
        assert!(item.should_retry(DEFAULT_MAX_ATTEMPTS));

        item.increment_attempt();
        item.increment_attempt();
        item.increment_attempt();
        assert!(!item.should_retry(DEFAULT_MAX_ATTEMPTS));
    }

    #[test]
    fn test_queue_item_serialization_roundtrip() {
        let item = QueueItem::with_priority(record(), Stage::Analyze, 5);
        let json = serde_json::to_string(&item).expect("serialize");
        let parsed: QueueItem = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.job.id, item.job.id);
        assert_eq!(parsed.priority, 5);
        assert_eq!(parsed.stage, Stage::Analyze);
    }

    #[test]
    fn test_dead_letter_item() {
        let entry = DeadLetterItem::new(QueueItem::new(record(), Stage::Fetch), "fetch-failed");
        assert_eq!(entry.reason, "fetch-failed");
        assert_eq!(entry.item.job.id, "j1");
    }

    #[test]
    fn test_stage_tags() {
        assert_eq!(Stage::Fetch.as_str(), "fetch");
        assert_eq!(Stage::Analyze.as_str(), "analyze");
        assert_eq!(Stage::Downstream.as_str(), "downstream");
    }
}
