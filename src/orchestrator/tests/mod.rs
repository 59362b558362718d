//! Lifecycle scenario tests
//!
//! Everything runs in-process: memory store (optionally wrapped to inject
//! write failures and record history), directory uploads in a temp dir and the
//! scripted engines.


use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::checkpoint_store::{CheckpointStore, MemoryCheckpointStore, StoreError, StoredJob};
use crate::engine::testing::{numbered_segments, FakeLoader, ScriptedTranscriber};
use crate::job::{JobConfig, JobRecord, JobStatus, ResumeToken, TranscriptSegment};
use crate::metrics::Metrics;
use crate::model_cache::ModelCache;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::upload::{DirectoryUploads, UploadedFile};

/// Memory store that can fail writes and remembers every accepted write
#[derive(Default)]
pub(super) struct TestStore {
    inner: MemoryCheckpointStore,
    /// Remaining record writes to reject
    fail_saves: AtomicUsize,
    /// Remaining segment writes to reject
    fail_segment_saves: AtomicUsize,
    history: Mutex<Vec<(ResumeToken, JobStatus, f64)>>,
}

impl TestStore {
    pub fn fail_next_saves(&self, count: usize) {
        self.fail_saves.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_segment_saves(&self, count: usize) {
        self.fail_segment_saves.store(count, Ordering::SeqCst);
    }

    /// Accepted worker writes, in order
    pub fn history(&self) -> Vec<(ResumeToken, JobStatus, f64)> {
        self.history.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn remember(&self, record: &JobRecord) {
        self.history
            .lock()
            .unwrap()
            .push((record.resume_token, record.status, record.progress));
    }
}

#[async_trait]
impl CheckpointStore for TestStore {
    async fn load(&self, file_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.inner.load(file_id).await
    }

    async fn snapshot(&self, file_id: &str) -> Result<Option<StoredJob>, StoreError> {
        self.inner.snapshot(file_id).await
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list().await
    }

    async fn create(&self, record: &JobRecord) -> Result<bool, StoreError> {
        self.inner.create(record).await
    }

    async fn put(&self, record: &JobRecord, clear_segments: bool) -> Result<(), StoreError> {
        self.inner.put(record, clear_segments).await
    }

    async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_saves) {
            return Err(StoreError::Backend("injected save failure".to_string()));
        }
        self.inner.save(record).await?;
        self.remember(record);
        Ok(())
    }

    async fn save_segments(
        &self,
        record: &JobRecord,
        segments: &[TranscriptSegment],
    ) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_segment_saves) {
            return Err(StoreError::Backend("injected segment failure".to_string()));
        }
        self.inner.save_segments(record, segments).await?;
        self.remember(record);
        Ok(())
    }

    async fn segments(&self, file_id: &str) -> Result<Vec<TranscriptSegment>, StoreError> {
        self.inner.segments(file_id).await
    }

    async fn clear_segments(&self, file_id: &str) -> Result<(), StoreError> {
        self.inner.clear_segments(file_id).await
    }
}

pub(super) struct Harness {
    pub orchestrator: Orchestrator,
    pub loader: Arc<FakeLoader>,
    pub models: Arc<ModelCache>,
    pub store: Arc<TestStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(segments: usize) -> Self {
        Self::with_transcriber(ScriptedTranscriber::new(numbered_segments(segments)))
    }

    pub fn with_transcriber(transcriber: ScriptedTranscriber) -> Self {
        Self::with_settings(transcriber, settings())
    }

    pub fn with_settings(transcriber: ScriptedTranscriber, settings: OrchestratorSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::default());
        let loader = Arc::new(FakeLoader::new(transcriber));
        Self::assemble(dir, store, loader, settings)
    }

    /// Same store, uploads and engines, fresh orchestrator: a process restart
    pub fn restarted(&self) -> Orchestrator {
        let uploads = Arc::new(DirectoryUploads::new(self.dir.path().join("uploads")).unwrap());
        Orchestrator::new(
            self.store.clone(),
            Arc::new(ModelCache::new(self.loader.clone(), Metrics::disabled())),
            uploads,
            settings(),
            Metrics::disabled(),
        )
    }

    fn assemble(
        dir: TempDir,
        store: Arc<TestStore>,
        loader: Arc<FakeLoader>,
        settings: OrchestratorSettings,
    ) -> Self {
        let uploads = Arc::new(DirectoryUploads::new(dir.path().join("uploads")).unwrap());
        let models = Arc::new(ModelCache::new(loader.clone(), Metrics::disabled()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            models.clone(),
            uploads,
            settings,
            Metrics::disabled(),
        );
        Self {
            orchestrator,
            loader,
            models,
            store,
            dir,
        }
    }

    pub async fn upload(&self, file_id: &str, duration: f64) -> JobRecord {
        let file = UploadedFile::new(file_id, format!("/audio/{}.wav", file_id), duration);
        self.orchestrator.register(&file).await.unwrap()
    }

    pub async fn record(&self, file_id: &str) -> JobRecord {
        self.store.load(file_id).await.unwrap().unwrap()
    }

    pub async fn segments(&self, file_id: &str) -> Vec<TranscriptSegment> {
        self.store.segments(file_id).await.unwrap()
    }
}

pub(super) fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        default_job: config(false),
        checkpoint_retry_backoff: Duration::from_millis(1),
        ..OrchestratorSettings::default()
    }
}

pub(super) fn config(diarize: bool) -> JobConfig {
    JobConfig {
        model: "large-v3".to_string(),
        language: "en".to_string(),
        diarize,
        diarization_model: "pyannote".to_string(),
        prompt: String::new(),
    }
}

/// Poll until `check` holds, failing the test after two seconds
pub(super) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}
