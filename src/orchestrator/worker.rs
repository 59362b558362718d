//! Job worker
//!
//! One worker drives one attempt of one job: acquire the engine, transcribe,
//! optionally diarize, persist segments, finalize. Every durable write goes
//! through the token-guarded store operations, so a worker superseded by a
//! force restart is stopped by its next write and exits without touching the
//! record.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::checkpoint_store::{CheckpointStore, StoreError};
use crate::engine::{AudioRef, EngineError, EngineEvent, RawSegment, TranscribeRequest};
use crate::job::{
    Checkpoint, ErrorKind, JobConfig, JobError, JobRecord, JobStatus, ProcessedUnit, Stage,
    TranscriptSegment,
};
use crate::metrics::Metrics;
use crate::model_cache::ModelCache;
use crate::orchestrator::{JobOutcome, OrchestratorSettings};
use crate::stage_tracker::{StageTracker, TrackerEvent};

/// Why a pipeline stopped before completing
pub(crate) enum WorkerExit {
    /// A newer resume token owns the record
    Stale,
    Failed(JobError),
}

impl From<EngineError> for WorkerExit {
    fn from(e: EngineError) -> Self {
        WorkerExit::Failed(JobError::new(e.kind(), e.to_string()))
    }
}

pub(crate) struct Worker {
    pub store: Arc<dyn CheckpointStore>,
    pub models: Arc<ModelCache>,
    pub metrics: Metrics,
    pub settings: Arc<OrchestratorSettings>,
    /// Last record successfully written by this worker
    pub record: JobRecord,
    pub audio: AudioRef,
    pub config: JobConfig,
    /// Continue from persisted state instead of starting clean
    pub resume: bool,
    pub tracker: StageTracker,
}

impl Worker {
    pub async fn run(mut self) -> JobOutcome {
        let started = Instant::now();
        let file_id = self.record.file_id.clone();
        let token = self.record.resume_token;
        info!(
            "Worker {} for {} started ({})",
            token,
            file_id,
            if self.resume { "resume" } else { "fresh" }
        );

        let outcome = match self.pipeline().await {
            Ok(()) => {
                info!("Job {} completed ({})", file_id, token);
                JobOutcome::Completed
            }
            Err(WorkerExit::Stale) => {
                info!("Worker {} for {} superseded, exiting", token, file_id);
                self.metrics.record_stale_exit().await;
                return JobOutcome::Superseded;
            }
            Err(WorkerExit::Failed(job_error)) => {
                error!(
                    "Job {} failed ({}): {}",
                    file_id,
                    job_error.kind.as_str(),
                    job_error.message
                );
                let kind = job_error.kind;
                match self.mark_failed(job_error).await {
                    Ok(()) => JobOutcome::Failed(kind),
                    Err(WorkerExit::Stale) => {
                        self.metrics.record_stale_exit().await;
                        return JobOutcome::Superseded;
                    }
                    Err(WorkerExit::Failed(e)) => {
                        error!("Could not record failure of {}: {}", file_id, e.message);
                        JobOutcome::Failed(kind)
                    }
                }
            }
        };

        let label = match &outcome {
            JobOutcome::Completed => "completed",
            _ => "failed",
        };
        self.metrics
            .record_job_finished(&self.config.model, label, started.elapsed().as_secs_f64())
            .await;
        outcome
    }

    async fn pipeline(&mut self) -> Result<(), WorkerExit> {
        let file_id = self.record.file_id.clone();

        // Stage 1: engine
        let models = self.models.clone();
        let model = self.config.model.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = move |fraction: f64| {
            let _ = tx.send(EngineEvent::Progress(fraction));
        };
        let transcriber = self
            .drive(
                models.acquire_transcriber(&model, &progress),
                rx,
                TrackerEvent::ModelLoad,
            )
            .await?;
        self.record.model_used = Some(model);

        // Stage 2: transcription, skipping what a previous attempt persisted
        let existing = if self.resume {
            self.store.segments(&file_id).await.map_err(read_failure)?
        } else {
            Vec::new()
        };
        let resume_from = existing.last().map(|segment| segment.end);
        if let Some(offset) = resume_from {
            info!(
                "Resuming {} after {} persisted segments (offset {:.2}s)",
                file_id,
                existing.len(),
                offset
            );
        }
        let request = TranscribeRequest {
            file_id: file_id.clone(),
            audio: self.audio.clone(),
            config: self.config.clone(),
            resume_from,
            checkpoint_blob: if self.resume {
                self.record.checkpoint_blob.clone()
            } else {
                Vec::new()
            },
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let mut raw: Vec<RawSegment> = self
            .drive(
                transcriber.transcribe(&request, tx),
                rx,
                TrackerEvent::Transcription,
            )
            .await?;
        if let Some(offset) = resume_from {
            raw.retain(|segment| segment.start >= offset);
        }
        debug!("{} transcribed {} new segments", file_id, raw.len());

        // Stage 3: diarization. Persisted and new segments go through one pass
        // so speaker ids mean the same person on both sides of a resume point.
        let mut relabeled = Vec::new();
        if self.config.diarize && !raw.is_empty() {
            let variant = self.config.diarization_model.clone();
            let (tx, rx) = mpsc::unbounded_channel();
            let progress = move |_: f64| {
                let _ = tx.send(EngineEvent::Progress(0.0));
            };
            let diarizer = self
                .drive(
                    models.acquire_diarizer(&variant, &progress),
                    rx,
                    TrackerEvent::Diarization,
                )
                .await?;

            let mut all: Vec<RawSegment> = existing
                .iter()
                .map(|segment| RawSegment {
                    start: segment.start,
                    end: segment.end,
                    text: segment.text.clone(),
                    speaker: None,
                })
                .collect();
            all.extend(raw.iter().cloned());

            let audio = self.audio.clone();
            let (tx, rx) = mpsc::unbounded_channel();
            let labels = self
                .drive(diarizer.diarize(&audio, &all, tx), rx, TrackerEvent::Diarization)
                .await?;
            if labels.len() != all.len() {
                return Err(WorkerExit::Failed(JobError::new(
                    ErrorKind::InferenceFailure,
                    format!(
                        "diarization returned {} labels for {} segments",
                        labels.len(),
                        all.len()
                    ),
                )));
            }
            let (persisted_labels, new_labels) = labels.split_at(existing.len());
            for (segment, label) in raw.iter_mut().zip(new_labels.iter().cloned()) {
                segment.speaker = label;
            }
            relabeled = existing
                .iter()
                .zip(persisted_labels)
                .filter(|(segment, label)| segment.speaker != **label)
                .map(|(segment, label)| TranscriptSegment {
                    speaker: label.clone(),
                    ..segment.clone()
                })
                .collect();
            self.advance(TrackerEvent::Diarization(1.0)).await?;
        }

        // Stage 4: segments, one durable write each
        let total = (existing.len() + raw.len()) as u32;
        if total == 0 {
            return Err(WorkerExit::Failed(JobError::new(
                ErrorKind::InferenceFailure,
                "engine produced no transcript segments",
            )));
        }
        if !relabeled.is_empty() {
            info!(
                "Relabeling speakers of {} persisted segments of {}",
                relabeled.len(),
                file_id
            );
            let next = self.record.clone();
            self.persist(next, Some(&relabeled)).await?;
        }
        let mut sequence = existing.last().map(|s| s.sequence + 1).unwrap_or(0);
        let mut done = existing.len() as u32;
        for segment in raw {
            done += 1;
            let persisted = TranscriptSegment {
                sequence,
                start: segment.start,
                end: segment.end,
                text: segment.text.trim().to_string(),
                speaker: segment.speaker,
            };
            let update = self
                .tracker
                .observe(TrackerEvent::SegmentsPersisted { done, total });
            let mut next = self.record.clone();
            next.status = update.status;
            next.apply(&Checkpoint {
                stage: update.stage,
                progress: update.progress,
                last_processed_unit: Some(ProcessedUnit::Segment(sequence)),
                checkpoint_blob: None,
            });
            self.persist(next, Some(&[persisted])).await?;
            sequence += 1;
        }

        // Stage 5: finalize
        self.advance(TrackerEvent::Finalizing).await?;
        let mut next = self.record.clone();
        next.status = JobStatus::Completed;
        next.stage = Stage::Finalizing;
        next.progress = 1.0;
        next.error = None;
        next.updated_at = Utc::now();
        self.persist(next, None).await
    }

    /// Run an engine future while turning its events into checkpoints.
    ///
    /// Events still queued when the future resolves are applied before its
    /// result is returned.
    async fn drive<T, F>(
        &mut self,
        future: F,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        map: fn(f64) -> TrackerEvent,
    ) -> Result<T, WorkerExit>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        tokio::pin!(future);
        let result = loop {
            tokio::select! {
                result = &mut future => break result,
                Some(event) = events.recv() => self.on_engine_event(event, map).await?,
            }
        };
        while let Ok(event) = events.try_recv() {
            self.on_engine_event(event, map).await?;
        }
        Ok(result?)
    }

    async fn on_engine_event(
        &mut self,
        event: EngineEvent,
        map: fn(f64) -> TrackerEvent,
    ) -> Result<(), WorkerExit> {
        match event {
            EngineEvent::Progress(fraction) => self.advance(map(fraction)).await,
            EngineEvent::Checkpoint { offset, blob } => {
                let mut next = self.record.clone();
                next.apply(&Checkpoint {
                    stage: self.record.stage,
                    progress: self.record.progress,
                    last_processed_unit: Some(ProcessedUnit::AudioOffset(offset)),
                    checkpoint_blob: Some(blob),
                });
                self.persist(next, None).await
            }
        }
    }

    /// Apply a tracker event and persist it when it changes what clients see
    async fn advance(&mut self, event: TrackerEvent) -> Result<(), WorkerExit> {
        let update = self.tracker.observe(event);
        let unchanged = update.status == self.record.status
            && update.stage == self.record.stage
            && (update.progress - self.record.progress).abs() < 0.001;
        if unchanged {
            // Clamped or repeated value: the engine is alive, keep the stall
            // advisory quiet with an occasional timestamp-only write
            if !self.heartbeat_due() {
                return Ok(());
            }
            let mut next = self.record.clone();
            let now = Utc::now();
            next.last_progress_at = Some(now);
            next.updated_at = now;
            return self.persist(next, None).await;
        }
        if update.stage != self.record.stage {
            info!(
                "{} ({}): {}",
                self.record.file_id, self.record.resume_token, update.message
            );
            self.metrics.record_stage(update.stage.as_str()).await;
        }

        let mut next = self.record.clone();
        next.status = update.status;
        next.apply(&Checkpoint::progress(update.stage, update.progress));
        self.persist(next, None).await
    }

    fn heartbeat_due(&self) -> bool {
        let interval = self.settings.stall_threshold / 4;
        match self.record.last_progress_at {
            Some(last) => Utc::now().signed_duration_since(last) >= interval,
            None => true,
        }
    }

    /// Token-guarded write with bounded retries
    async fn persist(
        &mut self,
        next: JobRecord,
        segments: Option<&[TranscriptSegment]>,
    ) -> Result<(), WorkerExit> {
        let attempts = self.settings.checkpoint_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match segments {
                Some(segments) => self.store.save_segments(&next, segments).await,
                None => self.store.save(&next).await,
            };
            match result {
                Ok(()) => {
                    self.record = next;
                    return Ok(());
                }
                Err(StoreError::StaleToken { .. }) | Err(StoreError::NotFound(_)) => {
                    return Err(WorkerExit::Stale);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Checkpoint write for {} failed (attempt {}/{}): {}",
                        next.file_id, attempt, attempts, e
                    );
                    self.metrics.record_checkpoint_retry().await;
                    tokio::time::sleep(self.settings.checkpoint_retry_backoff * attempt).await;
                }
                Err(e) => {
                    return Err(WorkerExit::Failed(JobError::new(
                        ErrorKind::CheckpointWriteFailure,
                        format!("checkpoint write failed after {} attempts: {}", attempts, e),
                    )));
                }
            }
        }
    }

    /// Record the failure; the checkpoint and persisted segments are kept
    async fn mark_failed(&mut self, job_error: JobError) -> Result<(), WorkerExit> {
        let mut next = self.record.clone();
        next.status = JobStatus::Failed;
        next.error = Some(job_error);
        next.updated_at = Utc::now();
        self.persist(next, None).await
    }
}

fn read_failure(e: StoreError) -> WorkerExit {
    if e.is_stale() {
        return WorkerExit::Stale;
    }
    WorkerExit::Failed(JobError::new(
        ErrorKind::CheckpointWriteFailure,
        format!("could not read persisted segments: {}", e),
    ))
}
