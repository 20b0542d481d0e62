//! Pipeline configuration.
//!
//! One nested structure covering every subsystem, fully defaulted so a
//! partial YAML file (or none at all) works. Durations are expressed
//! in seconds in the file; `validate` rejects zero capacities,
//! inverted bounds and out-of-range thresholds before anything starts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::{BreakerConfig, CandidateProfile, RemoteConfig, RetryPolicy};
use crate::analysis::AnalysisConfig;
use crate::batcher::BatcherConfig;
use crate::fetch::FetchConfig;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Redis connection URL; in-memory store when absent.
    pub redis_url: Option<String>,
    /// Namespace prefix for durable-store keys.
    pub queue_name: String,
    /// Candidate profile jobs are scored against.
    pub profile: CandidateProfile,
    pub queue: QueueSettings,
    pub pool: PoolSettings,
    pub batcher: BatcherSettings,
    pub fetch: FetchSettings,
    pub analyzer: AnalyzerSettings,
    pub analysis: AnalysisSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_name: "jobflow".to_string(),
            profile: CandidateProfile::default(),
            queue: QueueSettings::default(),
            pool: PoolSettings::default(),
            batcher: BatcherSettings::default(),
            fetch: FetchSettings::default(),
            analyzer: AnalyzerSettings::default(),
            analysis: AnalysisSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub high_water_ratio: f64,
    pub low_water_ratio: f64,
    pub sync_interval_secs: u64,
    pub item_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let base = QueueConfig::default();
        Self {
            capacity: base.capacity,
            high_water_ratio: base.high_water_ratio,
            low_water_ratio: base.low_water_ratio,
            sync_interval_secs: base.sync_interval.as_secs(),
            item_ttl_secs: base.item_ttl.as_secs(),
            sweep_interval_secs: base.sweep_interval.as_secs(),
            max_attempts: base.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub requests_per_second: u32,
    pub window_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub request_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_check_url: Option<String>,
    pub degraded_error_rate: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let base = PoolConfig::default();
        Self {
            pool_size: base.pool_size,
            max_pool_size: base.max_pool_size,
            requests_per_second: base.requests_per_second,
            window_secs: base.window.as_secs(),
            max_attempts: base.max_attempts,
            base_delay_ms: base.base_delay.as_millis() as u64,
            max_delay_secs: base.max_delay.as_secs(),
            request_timeout_secs: base.request_timeout.as_secs(),
            health_check_interval_secs: base.health_check_interval.as_secs(),
            health_check_url: base.health_check_url,
            degraded_error_rate: base.degraded_error_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherSettings {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    pub sample_interval_secs: u64,
    pub memory_threshold: f64,
    pub safety_margin: f64,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        let base = BatcherConfig::default();
        Self {
            min_batch_size: base.min_batch_size,
            max_batch_size: base.max_batch_size,
            initial_batch_size: base.initial_batch_size,
            sample_interval_secs: base.sample_interval.as_secs(),
            memory_threshold: base.memory_threshold,
            safety_margin: base.safety_margin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        let base = FetchConfig::default();
        Self {
            workers: base.workers,
            max_attempts: base.max_attempts,
            cache_ttl_secs: base.cache_ttl.as_secs(),
            cache_capacity: base.cache_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_probes: u32,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_secs: u64,
    pub retry_max_delay_secs: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        let remote = RemoteConfig::default();
        let breaker = BreakerConfig::default();
        let retry = RetryPolicy::default();
        Self {
            base_url: remote.base_url,
            api_key: remote.api_key,
            timeout_secs: remote.timeout.as_secs(),
            failure_threshold: breaker.failure_threshold,
            recovery_timeout_secs: breaker.recovery_timeout.as_secs(),
            half_open_max_probes: breaker.half_open_max_probes,
            retry_max_attempts: retry.max_attempts,
            retry_initial_delay_secs: retry.initial_delay.as_secs(),
            retry_max_delay_secs: retry.max_delay.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub workers: usize,
    pub score_threshold: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        let base = AnalysisConfig::default();
        Self {
            workers: base.workers,
            score_threshold: base.score_threshold,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a YAML file, applies environment
    /// overrides and validates the result.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFLOW_REDIS_URL`: overrides `redis_url`
    /// - `JOBFLOW_ANALYZER_URL`: overrides `analyzer.base_url`
    /// - `JOBFLOW_ANALYZER_API_KEY`: overrides `analyzer.api_key`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("JOBFLOW_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Ok(url) = std::env::var("JOBFLOW_ANALYZER_URL") {
            self.analyzer.base_url = url;
        }
        if let Ok(key) = std::env::var("JOBFLOW_ANALYZER_API_KEY") {
            self.analyzer.api_key = Some(key);
        }
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.capacity must be greater than 0".to_string(),
            ));
        }
        if !(0.0 < self.queue.low_water_ratio
            && self.queue.low_water_ratio < self.queue.high_water_ratio
            && self.queue.high_water_ratio <= 1.0)
        {
            return Err(ConfigError::ValidationFailed(
                "queue water marks must satisfy 0 < low < high <= 1".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.max_attempts must be greater than 0".to_string(),
            ));
        }
        // Background tasks tick on these; a zero period panics at spawn.
        if self.queue.sync_interval_secs == 0 || self.queue.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue.sync_interval_secs and queue.sweep_interval_secs must be greater than 0"
                    .to_string(),
            ));
        }

        if self.pool.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.pool_size must be greater than 0".to_string(),
            ));
        }
        if self.pool.max_pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.max_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.pool.health_check_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.health_check_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.pool.requests_per_second == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.requests_per_second must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pool.degraded_error_rate) {
            return Err(ConfigError::ValidationFailed(
                "pool.degraded_error_rate must be in 0.0-1.0".to_string(),
            ));
        }

        if self.batcher.min_batch_size == 0
            || self.batcher.min_batch_size > self.batcher.max_batch_size
        {
            return Err(ConfigError::ValidationFailed(
                "batcher sizes must satisfy 0 < min <= max".to_string(),
            ));
        }
        if !(self.batcher.min_batch_size..=self.batcher.max_batch_size)
            .contains(&self.batcher.initial_batch_size)
        {
            return Err(ConfigError::ValidationFailed(
                "batcher.initial_batch_size must be within min..=max".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.batcher.memory_threshold)
            || !(0.0..=1.0).contains(&self.batcher.safety_margin)
        {
            return Err(ConfigError::ValidationFailed(
                "batcher thresholds must be in 0.0-1.0".to_string(),
            ));
        }
        if self.batcher.sample_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "batcher.sample_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.fetch.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch.workers must be greater than 0".to_string(),
            ));
        }

        if self.analyzer.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "analyzer.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.analyzer.retry_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "analyzer.retry_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.analysis.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "analysis.workers must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.analysis.score_threshold) {
            return Err(ConfigError::ValidationFailed(
                "analysis.score_threshold must be in 0.0-1.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue.capacity,
            high_water_ratio: self.queue.high_water_ratio,
            low_water_ratio: self.queue.low_water_ratio,
            sync_interval: Duration::from_secs(self.queue.sync_interval_secs),
            item_ttl: Duration::from_secs(self.queue.item_ttl_secs),
            sweep_interval: Duration::from_secs(self.queue.sweep_interval_secs),
            max_attempts: self.queue.max_attempts,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool.pool_size,
            max_pool_size: self.pool.max_pool_size,
            requests_per_second: self.pool.requests_per_second,
            window: Duration::from_secs(self.pool.window_secs),
            max_attempts: self.pool.max_attempts,
            base_delay: Duration::from_millis(self.pool.base_delay_ms),
            max_delay: Duration::from_secs(self.pool.max_delay_secs),
            request_timeout: Duration::from_secs(self.pool.request_timeout_secs),
            health_check_interval: Duration::from_secs(self.pool.health_check_interval_secs),
            health_check_url: self.pool.health_check_url.clone(),
            degraded_error_rate: self.pool.degraded_error_rate,
        }
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            min_batch_size: self.batcher.min_batch_size,
            max_batch_size: self.batcher.max_batch_size,
            initial_batch_size: self.batcher.initial_batch_size,
            sample_interval: Duration::from_secs(self.batcher.sample_interval_secs),
            memory_threshold: self.batcher.memory_threshold,
            safety_margin: self.batcher.safety_margin,
            ..BatcherConfig::default()
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            workers: self.fetch.workers,
            max_attempts: self.fetch.max_attempts,
            cache_ttl: Duration::from_secs(self.fetch.cache_ttl_secs),
            cache_capacity: self.fetch.cache_capacity,
            ..FetchConfig::default()
        }
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.analyzer.base_url.clone(),
            api_key: self.analyzer.api_key.clone(),
            timeout: Duration::from_secs(self.analyzer.timeout_secs),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.analyzer.failure_threshold,
            recovery_timeout: Duration::from_secs(self.analyzer.recovery_timeout_secs),
            half_open_max_probes: self.analyzer.half_open_max_probes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.analyzer.retry_max_attempts,
            initial_delay: Duration::from_secs(self.analyzer.retry_initial_delay_secs),
            max_delay: Duration::from_secs(self.analyzer.retry_max_delay_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            workers: self.analysis.workers,
            score_threshold: self.analysis.score_threshold,
            ..AnalysisConfig::default()
        }
    }
}
