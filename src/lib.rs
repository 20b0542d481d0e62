//! jobflow: a resilient job-enrichment pipeline.
//!
//! Jobs arrive as scraped stubs, get their descriptions fetched
//! through a rate-limited connection pool, are scored by an analyzer
//! chain that degrades gracefully (remote AI, local rules, neutral
//! default), and qualifying jobs are republished for a downstream
//! consumer. A hybrid durable/in-memory queue with priority,
//! backpressure and dead-lettering is the backbone every stage
//! publishes to and consumes from.

pub mod analysis;
pub mod analyzer;
pub mod batcher;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod queue;

pub use config::{ConfigError, PipelineConfig};
pub use error::{AnalyzerError, ErrorClass};
pub use job::{AnalysisMethod, DeadLetterItem, JobRecord, JobStatus, QueueItem, Stage};
