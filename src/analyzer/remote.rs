//! HTTP client for the remote analyzer backend.
//!
//! POSTs `{base}/analyze` with the job's fields and the candidate
//! profile; the backend answers with an [`AnalysisResult`] in JSON.
//! Failures are mapped onto [`AnalyzerError`] so the retry policy and
//! circuit breaker can classify them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::AnalyzerError;
use crate::job::JobRecord;

use super::{AnalysisResult, Analyzer, CandidateProfile};

/// Remote backend settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL, e.g. `http://analyzer:8080`.
    pub base_url: String,
    /// Bearer token sent when present.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    title: &'a str,
    company: &'a str,
    description: &'a str,
    profile: &'a CandidateProfile,
}

/// Analyzer backed by the remote HTTP JSON API.
pub struct RemoteAnalyzer {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl RemoteAnalyzer {
    pub fn new(config: RemoteConfig) -> Result<Self, AnalyzerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AnalyzerError::Connection(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/analyze", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Analyzer for RemoteAnalyzer {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn analyze(
        &self,
        job: &JobRecord,
        profile: &CandidateProfile,
    ) -> Result<AnalysisResult, AnalyzerError> {
        let body = AnalyzeRequest {
            title: &job.title,
            company: &job.company,
            description: job.description.as_deref().unwrap_or(""),
            profile,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        debug!(job_id = %job.id, "Calling remote analyzer");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AnalyzerError::Timeout
            } else {
                AnalyzerError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AnalyzerError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::Api {
                code: status.as_u16(),
                message: truncate(&message, 200),
            });
        }

        let result: AnalysisResult = response
            .json()
            .await
            .map_err(|e| AnalyzerError::InvalidResponse(e.to_string()))?;
        Ok(result.clamped())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
