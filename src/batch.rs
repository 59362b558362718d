//! Batch Coordinator
//!
//! Splits a source file into chunk files, registers a pending job for each and
//! optionally starts them with bounded concurrency. Batch progress is derived
//! from the chunk Job Records every time it is read; the batch record itself
//! only lists the chunks. The source file's own record is never touched.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::file_utils;
use crate::job::{JobConfig, JobStatus};
use crate::metrics::Metrics;
use crate::orchestrator::{DispatchOutcome, Orchestrator, OrchestratorError};
use crate::upload::UploadError;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Unknown file: {0}")]
    SourceNotFound(String),
    #[error("Unknown batch: {0}")]
    BatchNotFound(String),
    #[error("Invalid chunk specification: {0}")]
    InvalidChunkSpec(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How to cut the source audio, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChunkSpec {
    pub chunk_duration: f64,
    #[serde(default)]
    pub overlap: f64,
}

impl ChunkSpec {
    pub fn validate(&self) -> Result<(), BatchError> {
        if !self.chunk_duration.is_finite() || self.chunk_duration <= 0.0 {
            return Err(BatchError::InvalidChunkSpec(format!(
                "chunk duration must be positive, got {}",
                self.chunk_duration
            )));
        }
        if !self.overlap.is_finite() || self.overlap < 0.0 || self.overlap >= self.chunk_duration {
            return Err(BatchError::InvalidChunkSpec(format!(
                "overlap must be in [0, {}), got {}",
                self.chunk_duration, self.overlap
            )));
        }
        Ok(())
    }
}

/// Chunk windows `(start, end)` covering `[0, duration]`.
///
/// Consecutive windows start `chunk_duration - overlap` apart; the last one is
/// cut at the end of the audio.
pub fn plan_chunks(duration: f64, spec: ChunkSpec) -> Vec<(f64, f64)> {
    let mut windows = Vec::new();
    if duration <= 0.0 {
        return windows;
    }
    let step = spec.chunk_duration - spec.overlap;
    let mut start: f64 = 0.0;
    loop {
        let end = (start + spec.chunk_duration).min(duration);
        windows.push((start, end));
        if end >= duration {
            break;
        }
        start += step;
    }
    windows
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
    pub batch_id: String,
    pub source_file_id: String,
    /// Chunk file ids in audio order
    pub chunk_file_ids: Vec<String>,
    pub auto_start: bool,
    pub chunk_spec: ChunkSpec,
    pub created_at: DateTime<Utc>,
}

/// Chunk counts by status, derived at read time
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchCounts {
    pub pending: usize,
    /// model_loading and processing
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkStatus {
    pub file_id: String,
    pub status: JobStatus,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchStatus {
    #[serde(flatten)]
    pub record: BatchRecord,
    pub counts: BatchCounts,
    pub chunks: Vec<ChunkStatus>,
}

pub struct BatchCoordinator {
    orchestrator: Orchestrator,
    /// Batch records when no directory is configured
    batches: DashMap<String, BatchRecord>,
    /// Batch records live here when set, one file per batch
    dir: Option<PathBuf>,
    start_concurrency: usize,
    metrics: Metrics,
}

impl BatchCoordinator {
    pub fn new(
        orchestrator: Orchestrator,
        dir: Option<PathBuf>,
        start_concurrency: usize,
        metrics: Metrics,
    ) -> io::Result<Self> {
        if let Some(dir) = &dir {
            file_utils::ensure_dir(dir)?;
        }
        Ok(Self {
            orchestrator,
            batches: DashMap::new(),
            dir,
            start_concurrency: start_concurrency.max(1),
            metrics,
        })
    }

    fn batch_path(&self, batch_id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(file_utils::safe_file_name(batch_id, "batch.json")))
    }

    /// Create the chunk jobs of `source_file_id` and optionally start them.
    ///
    /// Returns once the chunks are registered; starts happen in the background.
    pub async fn split_and_enqueue(
        &self,
        source_file_id: &str,
        spec: ChunkSpec,
        auto_start: bool,
        config: Option<JobConfig>,
    ) -> Result<BatchRecord, BatchError> {
        spec.validate()?;
        let uploads = self.orchestrator.uploads().clone();
        let source = uploads
            .get(source_file_id)
            .await?
            .ok_or_else(|| BatchError::SourceNotFound(source_file_id.to_string()))?;

        let windows = plan_chunks(source.duration, spec);
        if windows.is_empty() {
            return Err(BatchError::InvalidChunkSpec(format!(
                "{} has no audio to split",
                source_file_id
            )));
        }

        let mut chunk_file_ids = Vec::with_capacity(windows.len());
        for (index, (start, end)) in windows.iter().enumerate() {
            let chunk = uploads.create_chunk(&source, index, *start, *end).await?;
            self.orchestrator.register(&chunk).await?;
            chunk_file_ids.push(chunk.file_id);
        }

        let record = BatchRecord {
            batch_id: Uuid::new_v4().to_string(),
            source_file_id: source_file_id.to_string(),
            chunk_file_ids,
            auto_start,
            chunk_spec: spec,
            created_at: Utc::now(),
        };
        match self.batch_path(&record.batch_id) {
            Some(path) => {
                let doc = record.clone();
                tokio::task::spawn_blocking(move || file_utils::write_json_atomic(&path, &doc))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
            }
            None => {
                self.batches.insert(record.batch_id.clone(), record.clone());
            }
        }
        info!(
            "Batch {} split {} into {} chunks (auto_start={})",
            record.batch_id,
            source_file_id,
            record.chunk_file_ids.len(),
            auto_start
        );
        self.metrics
            .record_batch_created(record.chunk_file_ids.len(), auto_start)
            .await;

        if auto_start {
            let config = config.unwrap_or_else(|| self.orchestrator.default_config());
            self.spawn_starts(record.chunk_file_ids.clone(), config);
        }
        Ok(record)
    }

    /// Start chunks in order, at most `start_concurrency` running at once
    fn spawn_starts(&self, chunk_file_ids: Vec<String>, config: JobConfig) {
        let orchestrator = self.orchestrator.clone();
        let permits = Arc::new(Semaphore::new(self.start_concurrency));
        tokio::spawn(async move {
            for file_id in chunk_file_ids {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                match orchestrator.start(&file_id, config.clone(), false).await {
                    Ok(outcome) => {
                        debug!("Batch start of {}: {}", file_id, outcome.as_str());
                        if let Some(handle) = outcome.into_handle() {
                            tokio::spawn(async move {
                                handle.wait().await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => warn!("Batch start of {} failed: {}", file_id, e),
                }
            }
        });
    }

    pub async fn get(&self, batch_id: &str) -> Result<BatchRecord, BatchError> {
        let path = match self.batch_path(batch_id) {
            Some(path) => path,
            None => {
                return self
                    .batches
                    .get(batch_id)
                    .map(|record| record.clone())
                    .ok_or_else(|| BatchError::BatchNotFound(batch_id.to_string()));
            }
        };
        tokio::task::spawn_blocking(move || file_utils::read_json::<BatchRecord>(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??
            .ok_or_else(|| BatchError::BatchNotFound(batch_id.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn cached_batches(&self) -> usize {
        self.batches.len()
    }

    /// Batch record with counts derived from the chunk records right now
    pub async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let record = self.get(batch_id).await?;
        let store = self.orchestrator.store();
        let mut counts = BatchCounts::default();
        let mut chunks = Vec::with_capacity(record.chunk_file_ids.len());
        for file_id in &record.chunk_file_ids {
            let (status, progress) = match store.load(file_id).await.map_err(OrchestratorError::from)? {
                Some(job) => (job.status, job.progress),
                None => (JobStatus::Pending, 0.0),
            };
            match status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::ModelLoading | JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            chunks.push(ChunkStatus {
                file_id: file_id.clone(),
                status,
                progress,
            });
        }
        Ok(BatchStatus {
            record,
            counts,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(chunk_duration: f64, overlap: f64) -> ChunkSpec {
        ChunkSpec {
            chunk_duration,
            overlap,
        }
    }

    #[test]
    fn test_five_minutes_in_two_minute_chunks() {
        let windows = plan_chunks(300.0, spec(120.0, 0.0));
        assert_eq!(windows, vec![(0.0, 120.0), (120.0, 240.0), (240.0, 300.0)]);
    }

    #[test]
    fn test_overlap_shifts_windows() {
        let windows = plan_chunks(300.0, spec(120.0, 10.0));
        assert_eq!(windows, vec![(0.0, 120.0), (110.0, 230.0), (220.0, 300.0)]);

        // Exact fit does not produce an empty tail
        assert_eq!(plan_chunks(240.0, spec(120.0, 0.0)).len(), 2);
        assert_eq!(plan_chunks(60.0, spec(120.0, 0.0)), vec![(0.0, 60.0)]);
        assert!(plan_chunks(0.0, spec(120.0, 0.0)).is_empty());
    }

    #[test]
    fn test_invalid_specs() {
        assert!(spec(0.0, 0.0).validate().is_err());
        assert!(spec(60.0, 60.0).validate().is_err());
        assert!(spec(60.0, -1.0).validate().is_err());
        assert!(spec(f64::NAN, 0.0).validate().is_err());
        assert!(spec(60.0, 5.0).validate().is_ok());
    }
}
