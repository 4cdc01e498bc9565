use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::transcript::TranscriptEntry;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session metadata attached to a scoring request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_name: Option<String>,
    /// Interview duration in seconds.
    pub duration: u64,
    pub completed_phases: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringRequest {
    pub interview_id: String,
    pub transcript: Vec<TranscriptEntry>,
    pub metadata: ScoringMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringResponse {
    pub overall_score: f32,
    pub fit_score: f32,
    pub tech_score: f32,
    pub brain_score: f32,
    pub feedback: String,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
}

// The `ScoringApi` trait is the contract for the external collaborator that
// turns a finished transcript into scores. The session never cares where the
// scores come from, which keeps the orchestration logic testable with
// `mockall`'s generated `MockScoringApi` instead of a live backend.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait ScoringApi {
    async fn score_interview(
        &self,
        request: &ScoringRequest,
    ) -> Result<ScoringResponse, SessionError>;
}

/// HTTP client for the scoring backend.
pub struct ScoringClient {
    client: Client,
    base_url: String,
}

impl ScoringClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ScoringApi for ScoringClient {
    async fn score_interview(
        &self,
        request: &ScoringRequest,
    ) -> Result<ScoringResponse, SessionError> {
        let url = format!("{}/score-interview", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("scoring request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SessionError::Network(format!(
                "scoring API returned {}",
                response.status()
            )));
        }

        response
            .json::<ScoringResponse>()
            .await
            .map_err(|e| SessionError::Network(format!("invalid scoring response: {e}")))
    }
}
