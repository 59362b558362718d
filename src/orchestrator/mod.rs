//! Job Orchestrator
//!
//! Decides what to do with a file right now (start, resume, reject, restart)
//! and launches workers. Every decision and the write that acts on it happen
//! under a per-file lock, so requests for the same file never interleave while
//! different files proceed in parallel.
//!
//! State machine of one job:
//!
//! ```text
//! pending -> model_loading -> processing -> completed
//!                                   \-> failed (start or resume available)
//! any state -> (force restart) -> pending   [in-flight progress discarded]
//! ```

mod registry;
mod worker;

#[cfg(test)]
mod tests;

pub use registry::{LiveState, Registry};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::checkpoint_store::{CheckpointStore, StoreError, StoredJob};
use crate::config::{defaults, JobsConfig};
use crate::engine::{AudioRef, EngineKey};
use crate::job::{ErrorKind, JobConfig, JobRecord, JobStatus, ResumeToken, Stage, TranscriptSegment};
use crate::keyed_lock::KeyedLocks;
use crate::metrics::Metrics;
use crate::model_cache::ModelCache;
use crate::stage_tracker::StageTracker;
use crate::status::StatusView;
use crate::upload::{UploadError, UploadSubsystem, UploadedFile};
use worker::Worker;

/// Orchestrator error types
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Neither the upload subsystem nor the store knows the file
    #[error("Unknown file: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Outcome of Determine for the current state of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Resume,
    RejectAlreadyRunning,
    AlreadyCompleted,
}

/// What a caller asks for
#[derive(Debug, Clone)]
pub enum Request {
    /// `force` turns a start into a force restart
    Start { config: JobConfig, force: bool },
    Resume,
    ForceRestart { config: JobConfig },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Start { .. } => "start",
            Request::Resume => "resume",
            Request::ForceRestart { .. } => "force_restart",
        }
    }
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(ErrorKind),
    /// A restart took the job over before this attempt finished
    Superseded,
}

/// Handle on one attempt of a job. Dropping it does not affect the worker.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub file_id: String,
    pub resume_token: ResumeToken,
    outcome: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    fn new(file_id: &str, token: ResumeToken, outcome: watch::Receiver<Option<JobOutcome>>) -> Self {
        Self {
            file_id: file_id.to_string(),
            resume_token: token,
            outcome,
        }
    }

    /// Outcome if the attempt already ended
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the attempt to end
    pub async fn wait(mut self) -> JobOutcome {
        loop {
            if let Some(outcome) = self.outcome.borrow_and_update().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                return self
                    .outcome
                    .borrow()
                    .clone()
                    .unwrap_or(JobOutcome::Superseded);
            }
        }
    }
}

/// Result of a dispatched request
#[derive(Debug)]
pub enum DispatchOutcome {
    Started(JobHandle),
    Resumed(JobHandle),
    /// Accepted; starts once the model loader is free
    Queued(JobHandle),
    /// A live worker holds the current token; not an error
    AlreadyRunning(Option<JobHandle>),
    /// Completed jobs are only restarted on explicit force
    AlreadyCompleted,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Started(_) => "started",
            DispatchOutcome::Resumed(_) => "resumed",
            DispatchOutcome::Queued(_) => "queued",
            DispatchOutcome::AlreadyRunning(_) => "already_running",
            DispatchOutcome::AlreadyCompleted => "already_completed",
        }
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            DispatchOutcome::Started(h)
            | DispatchOutcome::Resumed(h)
            | DispatchOutcome::Queued(h) => Some(h),
            DispatchOutcome::AlreadyRunning(h) => h.as_ref(),
            DispatchOutcome::AlreadyCompleted => None,
        }
    }

    pub fn into_handle(self) -> Option<JobHandle> {
        match self {
            DispatchOutcome::Started(h)
            | DispatchOutcome::Resumed(h)
            | DispatchOutcome::Queued(h) => Some(h),
            DispatchOutcome::AlreadyRunning(h) => h,
            DispatchOutcome::AlreadyCompleted => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Settings for requests that do not carry their own
    pub default_job: JobConfig,
    pub stall_threshold: chrono::Duration,
    pub checkpoint_retry_attempts: u32,
    pub checkpoint_retry_backoff: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            default_job: config.default_job_config(),
            stall_threshold: config.stall_threshold(),
            checkpoint_retry_attempts: config.checkpoint_retry_attempts,
            checkpoint_retry_backoff: Duration::from_millis(config.checkpoint_retry_backoff_ms),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_job: JobConfig::default(),
            stall_threshold: chrono::Duration::seconds(defaults::STALL_THRESHOLD_SECONDS as i64),
            checkpoint_retry_attempts: defaults::CHECKPOINT_RETRY_ATTEMPTS,
            checkpoint_retry_backoff: Duration::from_millis(defaults::CHECKPOINT_RETRY_BACKOFF_MS),
        }
    }
}

/// Pure decision table; `live` is the token held by a registered worker
///
/// A completed record wins over a registry entry its worker has not dropped
/// yet. A failed one does not: a resume would reuse the token still held by
/// the exiting worker.
pub fn decide(record: &JobRecord, live: Option<ResumeToken>) -> Action {
    match record.status {
        JobStatus::Completed => Action::AlreadyCompleted,
        _ if live == Some(record.resume_token) => Action::RejectAlreadyRunning,
        JobStatus::Pending | JobStatus::Failed => Action::Start,
        // Persisted as active but nobody is driving it: crash recovery
        JobStatus::ModelLoading | JobStatus::Processing => Action::Resume,
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    models: Arc<ModelCache>,
    uploads: Arc<dyn UploadSubsystem>,
    registry: Arc<Registry>,
    locks: Arc<KeyedLocks>,
    settings: Arc<OrchestratorSettings>,
    metrics: Metrics,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        models: Arc<ModelCache>,
        uploads: Arc<dyn UploadSubsystem>,
        settings: OrchestratorSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            models,
            uploads,
            registry: Arc::new(Registry::new()),
            locks: Arc::new(KeyedLocks::new()),
            settings: Arc::new(settings),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn uploads(&self) -> &Arc<dyn UploadSubsystem> {
        &self.uploads
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn default_config(&self) -> JobConfig {
        self.settings.default_job.clone()
    }


    async fn upload(&self, file_id: &str) -> Result<UploadedFile, OrchestratorError> {
        self.uploads
            .get(file_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(file_id.to_string()))
    }

    /// Register an uploaded file and create its pending Job Record
    pub async fn register(&self, file: &UploadedFile) -> Result<JobRecord, OrchestratorError> {
        self.uploads.register(file).await?;
        let record = JobRecord::new_pending(file.file_id.clone());
        if self.store.create(&record).await? {
            debug!("Registered {}", file.file_id);
            return Ok(record);
        }
        self.store
            .load(&file.file_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(file.file_id.clone()))
    }

    /// What a request for `file_id` would do right now. Read-only.
    ///
    /// The answer can be outdated as soon as the lock is released: concurrent
    /// callers may all see `Start` for the same pending file. Only
    /// [`Orchestrator::dispatch`] decides and acts in one step, which is what
    /// guarantees a single start under concurrency.
    pub async fn determine(&self, file_id: &str) -> Result<Action, OrchestratorError> {
        let _lock = self.locks.lock(file_id).await;
        match self.store.load(file_id).await? {
            Some(record) => Ok(decide(&record, self.registry.live_token(file_id))),
            None => {
                self.upload(file_id).await?;
                Ok(Action::Start)
            }
        }
    }

    pub async fn start(
        &self,
        file_id: &str,
        config: JobConfig,
        force: bool,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        self.dispatch(file_id, Request::Start { config, force }).await
    }

    pub async fn resume(&self, file_id: &str) -> Result<DispatchOutcome, OrchestratorError> {
        self.dispatch(file_id, Request::Resume).await
    }

    pub async fn force_restart(
        &self,
        file_id: &str,
        config: JobConfig,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        self.dispatch(file_id, Request::ForceRestart { config }).await
    }

    /// Determine and act on the decision as one step under the file lock
    pub async fn dispatch(
        &self,
        file_id: &str,
        request: Request,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let _lock = self.locks.lock(file_id).await;

        let upload = self.upload(file_id).await?;
        let record = match self.store.load(file_id).await? {
            Some(record) => record,
            None => {
                let record = JobRecord::new_pending(file_id);
                self.store.create(&record).await?;
                record
            }
        };
        let action = decide(&record, self.registry.live_token(file_id));
        let request_name = request.name();
        debug!("{} on {} ({}): {:?}", request_name, file_id, record.status, action);

        let outcome = match (request, action) {
            (Request::ForceRestart { config }, _) | (Request::Start { config, force: true }, _) => {
                self.restart_locked(record, &upload, config).await?
            }
            (_, Action::RejectAlreadyRunning) => {
                DispatchOutcome::AlreadyRunning(self.registry.handle(file_id))
            }
            (_, Action::AlreadyCompleted) => DispatchOutcome::AlreadyCompleted,
            (Request::Start { config, .. }, Action::Start) => {
                self.start_fresh_locked(record, &upload, config).await?
            }
            (Request::Resume, Action::Start) => {
                let has_progress =
                    record.has_checkpoint() || self.store.segment_count(file_id).await? > 0;
                if record.status == JobStatus::Failed && has_progress {
                    self.resume_locked(record, &upload, false).await?
                } else {
                    // Nothing to re-attach to: same as a start
                    let config = record
                        .config
                        .clone()
                        .unwrap_or_else(|| self.default_config());
                    self.start_fresh_locked(record, &upload, config).await?
                }
            }
            (Request::Start { .. }, Action::Resume) | (Request::Resume, Action::Resume) => {
                self.resume_locked(record, &upload, true).await?
            }
        };

        self.metrics
            .record_job_action(request_name, outcome.as_str())
            .await;
        Ok(outcome)
    }

    /// Fresh attempt: new token, checkpoint and segments cleared in one write
    async fn start_fresh_locked(
        &self,
        mut record: JobRecord,
        upload: &UploadedFile,
        config: JobConfig,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        record.resume_token = record.resume_token.next();
        record.clear_checkpoint();
        record.progress = 0.0;
        record.error = None;
        record.model_used = None;
        record.config = Some(config.clone());
        info!("Starting {} ({})", record.file_id, record.resume_token);
        let handle = self
            .launch(record, upload.audio_ref(), config, false, true, None)
            .await?;
        Ok(DispatchOutcome::Started(handle))
    }

    /// Re-attach to the persisted checkpoint.
    ///
    /// Only reached when no live worker holds the token, so the token is reused.
    async fn resume_locked(
        &self,
        mut record: JobRecord,
        upload: &UploadedFile,
        interrupted: bool,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        if interrupted {
            record.interruption_count += 1;
        }
        record.error = None;
        let config = record
            .config
            .clone()
            .unwrap_or_else(|| self.default_config());
        record.config = Some(config.clone());
        info!(
            "Resuming {} ({}, {} interruptions, {} recovery attempts)",
            record.file_id, record.resume_token, record.interruption_count, record.recovery_attempts
        );
        let handle = self
            .launch(record, upload.audio_ref(), config, true, false, None)
            .await?;
        Ok(DispatchOutcome::Resumed(handle))
    }

    /// Reset to pending and start, or queue the start behind a model load
    async fn restart_locked(
        &self,
        mut record: JobRecord,
        upload: &UploadedFile,
        config: JobConfig,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        record.resume_token = record.resume_token.next();
        record.status = JobStatus::Pending;
        record.stage = Stage::Idle;
        record.progress = 0.0;
        record.clear_checkpoint();
        record.recovery_attempts += 1;
        record.error = None;
        record.model_used = None;
        record.config = Some(config.clone());
        record.updated_at = Utc::now();
        record.last_progress_at = None;

        // The pending transition and the segment wipe are one write
        self.store.put(&record, true).await?;
        info!(
            "Force restart of {} ({}, recovery attempt {})",
            record.file_id, record.resume_token, record.recovery_attempts
        );

        let key = EngineKey::transcriber(&config.model);
        if self.models.is_loading(&key) {
            let (tx, rx) = watch::channel(None);
            let handle = self
                .registry
                .register(&record.file_id, record.resume_token, true, rx);
            info!("{} queued until {} finishes loading", record.file_id, key);

            let this = self.clone();
            let audio = upload.audio_ref();
            let file_id = record.file_id.clone();
            let token = record.resume_token;
            tokio::spawn(async move {
                this.models.wait_until_loaded(&key).await;
                this.start_queued(&file_id, token, audio, config, tx).await;
            });
            return Ok(DispatchOutcome::Queued(handle));
        }

        let handle = self
            .launch(record, upload.audio_ref(), config, false, false, None)
            .await?;
        Ok(DispatchOutcome::Started(handle))
    }

    async fn start_queued(
        &self,
        file_id: &str,
        token: ResumeToken,
        audio: AudioRef,
        config: JobConfig,
        outcome: watch::Sender<Option<JobOutcome>>,
    ) {
        let _lock = self.locks.lock(file_id).await;

        let record = match self.store.load(file_id).await {
            Ok(Some(record)) if record.resume_token == token && record.status == JobStatus::Pending => {
                record
            }
            Ok(_) => {
                debug!("Queued start of {} ({}) superseded", file_id, token);
                self.registry.remove(file_id, token);
                let _ = outcome.send(Some(JobOutcome::Superseded));
                return;
            }
            Err(e) => {
                warn!("Queued start of {} failed to load record: {}", file_id, e);
                self.registry.remove(file_id, token);
                let _ = outcome.send(Some(JobOutcome::Superseded));
                return;
            }
        };

        self.registry.mark_running(file_id, token);
        if let Err(e) = self
            .launch(record, audio, config, false, false, Some(outcome))
            .await
        {
            warn!("Queued start of {} failed: {}", file_id, e);
            self.registry.remove(file_id, token);
        }
    }

    /// Persist the model_loading transition, register and spawn the worker
    async fn launch(
        &self,
        mut record: JobRecord,
        audio: AudioRef,
        config: JobConfig,
        resume: bool,
        clear_segments: bool,
        outcome: Option<watch::Sender<Option<JobOutcome>>>,
    ) -> Result<JobHandle, OrchestratorError> {
        let now = Utc::now();
        record.status = JobStatus::ModelLoading;
        record.stage = Stage::LoadingModel;
        record.updated_at = now;
        record.last_progress_at = Some(now);
        self.store.put(&record, clear_segments).await?;

        let file_id = record.file_id.clone();
        let token = record.resume_token;
        let tx = match outcome {
            Some(tx) => {
                self.registry.mark_running(&file_id, token);
                tx
            }
            None => {
                let (tx, rx) = watch::channel(None);
                self.registry.register(&file_id, token, false, rx);
                tx
            }
        };
        let handle = JobHandle::new(&file_id, token, tx.subscribe());

        let tracker = if resume {
            StageTracker::starting_at(record.progress)
        } else {
            StageTracker::new()
        };
        let worker = Worker {
            store: self.store.clone(),
            models: self.models.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            record,
            audio,
            config,
            resume,
            tracker,
        };

        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        metrics.set_active_workers(registry.len()).await;
        tokio::spawn(async move {
            let result = worker.run().await;
            registry.remove(&file_id, token);
            metrics.set_active_workers(registry.len()).await;
            let _ = tx.send(Some(result));
        });
        Ok(handle)
    }

    /// Resume every job a previous process left active
    pub async fn recover_interrupted(&self) -> Result<Vec<JobHandle>, OrchestratorError> {
        let mut handles = Vec::new();
        for record in self.store.list().await? {
            if !record.status.is_active() || self.registry.live_token(&record.file_id).is_some() {
                continue;
            }
            match self.dispatch(&record.file_id, Request::Resume).await {
                Ok(DispatchOutcome::Resumed(handle)) => handles.push(handle),
                Ok(other) => debug!("Recovery of {}: {}", record.file_id, other.as_str()),
                Err(e) => warn!("Cannot recover {}: {}", record.file_id, e),
            }
        }
        if !handles.is_empty() {
            info!("Resumed {} interrupted jobs", handles.len());
        }
        Ok(handles)
    }

    /// Read-only projection of the durable record and the live registry
    pub async fn status(&self, file_id: &str) -> Result<StatusView, OrchestratorError> {
        let snapshot = match self.store.snapshot(file_id).await? {
            Some(snapshot) => snapshot,
            None => {
                // Known upload, never started
                self.upload(file_id).await?;
                StoredJob {
                    record: JobRecord::new_pending(file_id),
                    segments: Vec::new(),
                }
            }
        };
        Ok(StatusView::project(
            &snapshot,
            self.registry.state(file_id),
            Utc::now(),
            self.settings.stall_threshold,
        ))
    }

    /// Persisted transcript segments in sequence order
    pub async fn segments(&self, file_id: &str) -> Result<Vec<TranscriptSegment>, OrchestratorError> {
        match self.store.snapshot(file_id).await? {
            Some(snapshot) => Ok(snapshot.segments),
            None => {
                self.upload(file_id).await?;
                Ok(Vec::new())
            }
        }
    }
}
