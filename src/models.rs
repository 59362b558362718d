// HTTP data models
//
// Request and response bodies of the job API. Domain types (status views,
// segments, batch status) are serialized directly; only the envelopes live here.

use serde::{Deserialize, Serialize};

use crate::batch::ChunkSpec;
use crate::job::{JobConfig, ResumeToken};
use crate::orchestrator::DispatchOutcome;

/// Optional overrides of the default job settings
#[derive(Debug, Default, Clone, Deserialize)]
pub struct JobConfigParams {
    pub model: Option<String>,
    pub language: Option<String>,
    pub diarize: Option<bool>,
    pub diarization_model: Option<String>,
    pub prompt: Option<String>,
}

impl JobConfigParams {
    /// Apply the overrides on top of `base`
    pub fn merge_into(self, base: JobConfig) -> JobConfig {
        JobConfig {
            model: self.model.unwrap_or(base.model),
            language: self.language.unwrap_or(base.language),
            diarize: self.diarize.unwrap_or(base.diarize),
            diarization_model: self.diarization_model.unwrap_or(base.diarization_model),
            prompt: self.prompt.unwrap_or(base.prompt),
        }
    }
}

/// Body of `POST /transcription/{file_id}/start`
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(flatten)]
    pub config: JobConfigParams,
    /// Restart even a completed or running job
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /transcription/{file_id}/restart`
#[derive(Debug, Default, Deserialize)]
pub struct RestartRequest {
    #[serde(flatten)]
    pub config: JobConfigParams,
}

/// Body of `POST /batch`
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub source_file_id: String,
    /// Chunk length in seconds
    pub chunk_duration: f64,
    #[serde(default)]
    pub overlap: f64,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub config: Option<JobConfigParams>,
}

impl BatchRequest {
    pub fn chunk_spec(&self) -> ChunkSpec {
        ChunkSpec {
            chunk_duration: self.chunk_duration,
            overlap: self.overlap,
        }
    }
}

/// Response of the start, resume and restart endpoints
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub file_id: String,
    /// started, resumed, queued, already_running or already_completed
    pub action: String,
    /// Token of the attempt the request attached to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    pub status_url: String,
}

impl ActionResponse {
    pub fn new(file_id: &str, outcome: &DispatchOutcome) -> Self {
        Self {
            file_id: file_id.to_string(),
            action: outcome.as_str().to_string(),
            resume_token: outcome.handle().map(|handle| handle.resume_token),
            status_url: format!("/transcription/{}", file_id),
        }
    }
}

/// Response of `POST /batch`
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub batch_id: String,
    pub chunk_file_ids: Vec<String>,
    pub status_url: String,
}

/// Error response for API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Machine-readable error label
    pub status: Option<String>,
}
