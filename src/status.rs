//! Status projection
//!
//! What polling clients see: a read-only view assembled from one store
//! snapshot and the live registry. Nothing here writes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checkpoint_store::StoredJob;
use crate::job::{JobError, JobStatus, ResumeToken, Stage};
use crate::orchestrator::LiveState;
use crate::stage_tracker::is_stalled;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusView {
    pub file_id: String,
    pub status: JobStatus,
    pub stage: Stage,
    /// Overall progress, 0.0 to 1.0
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    /// Advisory: active but no progress for longer than the threshold
    pub stalled: bool,
    pub model_used: Option<String>,
    pub resume_token: ResumeToken,
    pub interruption_count: u32,
    pub recovery_attempts: u32,
    pub segment_count: usize,
    /// A worker of this process is driving the current token
    pub running: bool,
    /// Force restart accepted, waiting for the model loader
    pub queued: bool,
    pub updated_at: DateTime<Utc>,
}

impl StatusView {
    pub fn project(
        job: &StoredJob,
        live: Option<LiveState>,
        now: DateTime<Utc>,
        stall_threshold: chrono::Duration,
    ) -> Self {
        let record = &job.record;
        let live = live.filter(|state| state.token == record.resume_token);
        Self {
            file_id: record.file_id.clone(),
            status: record.status,
            stage: record.stage,
            progress: record.progress,
            last_error: match record.status {
                JobStatus::Failed => record.error.clone(),
                _ => None,
            },
            stalled: is_stalled(
                record.status,
                record.last_progress_at,
                record.updated_at,
                now,
                stall_threshold,
            ),
            model_used: record.model_used.clone(),
            resume_token: record.resume_token,
            interruption_count: record.interruption_count,
            recovery_attempts: record.recovery_attempts,
            segment_count: job.segments.len(),
            running: live.map(|state| !state.queued).unwrap_or(false),
            queued: live.map(|state| state.queued).unwrap_or(false),
            updated_at: record.updated_at,
        }
    }
}
