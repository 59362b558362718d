// Job data model
//
// This module contains the durable Job Record and the types it is built from.
// A record is always written and read as a whole; nothing outside the store
// ever sees a half-updated record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a transcription job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the upload subsystem, or reset by a force restart
    Pending,
    /// Inference engine is being acquired
    ModelLoading,
    /// Transcription, diarization or segment persistence in progress
    Processing,
    /// Transcript persisted (terminal)
    Completed,
    /// Engine or storage error (retryable through start or resume)
    Failed,
}

impl JobStatus {
    /// A worker is expected to be driving the job
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::ModelLoading | JobStatus::Processing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::ModelLoading => "model_loading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-phase of an active job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    LoadingModel,
    Transcribing,
    Diarizing,
    CreatingSegments,
    Finalizing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::LoadingModel => "loading_model",
            Stage::Transcribing => "transcribing",
            Stage::Diarizing => "diarizing",
            Stage::CreatingSegments => "creating_segments",
            Stage::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation counter minted on every (re)start of a job.
///
/// Every durable write made by a worker is checked against the token stored
/// on the record; a worker holding an older generation is rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct ResumeToken(pub u64);

impl ResumeToken {
    pub fn next(self) -> Self {
        ResumeToken(self.0 + 1)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Furthest durably completed unit of work
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProcessedUnit {
    /// Audio offset in seconds reported by an engine checkpoint
    AudioOffset(f64),
    /// Sequence number of the last persisted transcript segment
    Segment(u32),
}

/// Error taxonomy recorded on failed jobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelUnavailable,
    InferenceFailure,
    CheckpointWriteFailure,
    StaleToken,
    AlreadyRunning,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::InferenceFailure => "inference_failure",
            ErrorKind::CheckpointWriteFailure => "checkpoint_write_failure",
            ErrorKind::StaleToken => "stale_token",
            ErrorKind::AlreadyRunning => "already_running",
        }
    }
}

/// Error attached to a record in `failed` status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Per-request transcription settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// Speech-to-text model variant (e.g. "large-v3")
    pub model: String,
    /// Language code, empty for engine auto-detection
    pub language: String,
    /// Run speaker diarization after transcription
    pub diarize: bool,
    /// Diarization model variant
    pub diarization_model: String,
    /// Initial prompt handed to the engine
    pub prompt: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            model: crate::config::defaults::MODEL.to_string(),
            language: String::new(),
            diarize: true,
            diarization_model: crate::config::defaults::DIARIZATION_MODEL.to_string(),
            prompt: String::new(),
        }
    }
}

/// One persisted transcript unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub sequence: u32,
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// Durable state of one file's transcription attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub file_id: String,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress: f64,
    #[serde(default)]
    pub last_processed_unit: Option<ProcessedUnit>,
    #[serde(default)]
    pub checkpoint_blob: Vec<u8>,
    pub resume_token: ResumeToken,
    #[serde(default)]
    pub interruption_count: u32,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub model_used: Option<String>,
    /// Settings of the current attempt, reused by resume
    #[serde(default)]
    pub config: Option<JobConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Time of the last progress event written by a worker
    #[serde(default)]
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Fresh pending record, as created at upload time
    pub fn new_pending<S: Into<String>>(file_id: S) -> Self {
        let now = Utc::now();
        Self {
            file_id: file_id.into(),
            status: JobStatus::Pending,
            stage: Stage::Idle,
            progress: 0.0,
            last_processed_unit: None,
            checkpoint_blob: Vec::new(),
            resume_token: ResumeToken::default(),
            interruption_count: 0,
            recovery_attempts: 0,
            error: None,
            model_used: None,
            config: None,
            created_at: now,
            updated_at: now,
            last_progress_at: None,
        }
    }

    /// Whether a resume has anything to re-attach to
    pub fn has_checkpoint(&self) -> bool {
        self.last_processed_unit.is_some() || !self.checkpoint_blob.is_empty()
    }

    /// Apply a worker checkpoint to the in-memory copy of the record
    pub fn apply(&mut self, checkpoint: &Checkpoint) {
        self.stage = checkpoint.stage;
        self.progress = checkpoint.progress;
        if let Some(unit) = checkpoint.last_processed_unit {
            self.last_processed_unit = Some(unit);
        }
        if let Some(blob) = &checkpoint.checkpoint_blob {
            self.checkpoint_blob = blob.clone();
        }
        let now = Utc::now();
        self.updated_at = now;
        self.last_progress_at = Some(now);
    }

    /// Drop everything produced by previous attempts
    pub fn clear_checkpoint(&mut self) {
        self.last_processed_unit = None;
        self.checkpoint_blob.clear();
    }
}

/// Fields written together by one checkpoint save
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub stage: Stage,
    pub progress: f64,
    pub last_processed_unit: Option<ProcessedUnit>,
    pub checkpoint_blob: Option<Vec<u8>>,
}

impl Checkpoint {
    pub fn progress(stage: Stage, progress: f64) -> Self {
        Self {
            stage,
            progress,
            last_processed_unit: None,
            checkpoint_blob: None,
        }
    }
}
