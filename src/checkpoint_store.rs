//! Checkpoint Store
//!
//! Durable home of Job Records and their transcript segments. Each file id owns
//! exactly one document holding the record and the segments, so a record and the
//! segments it describes are always swapped together.
//!
//! Worker writes go through [`CheckpointStore::save`] and
//! [`CheckpointStore::save_segments`], which compare the resume token of the
//! caller's record with the stored one and reject stale writers. Orchestrator
//! writes go through [`CheckpointStore::put`], which is unconditional and relies
//! on the orchestrator's per-file lock.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::file_utils;
use crate::job::{JobRecord, ResumeToken, TranscriptSegment};
use crate::keyed_lock::KeyedLocks;

/// Checkpoint store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record exists for the file
    #[error("Job record not found: {0}")]
    NotFound(String),
    /// The writer's resume token was superseded by a restart
    #[error("Stale resume token for {file_id}: writer holds {held}, record holds {current}")]
    StaleToken {
        file_id: String,
        held: ResumeToken,
        current: ResumeToken,
    },
    /// I/O error from the storage backend
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Any other backend failure
    #[error("Storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleToken { .. })
    }
}

/// Record and segments of one file, persisted as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    pub record: JobRecord,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

/// Transactional persistence for Job Records and transcript segments
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durable record, `None` when the job was never registered
    async fn load(&self, file_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Record and segments read together, so that a reader never pairs a
    /// record with segments of another attempt
    async fn snapshot(&self, file_id: &str) -> Result<Option<StoredJob>, StoreError>;

    /// All records, in no particular order
    async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Register a record if absent. Returns false when one already exists.
    async fn create(&self, record: &JobRecord) -> Result<bool, StoreError>;

    /// Unconditional record swap, optionally wiping the persisted segments in
    /// the same write
    async fn put(&self, record: &JobRecord, clear_segments: bool) -> Result<(), StoreError>;

    /// Token-guarded record swap
    async fn save(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Token-guarded upsert of segments (by sequence) together with the record
    async fn save_segments(
        &self,
        record: &JobRecord,
        segments: &[TranscriptSegment],
    ) -> Result<(), StoreError>;

    /// Persisted segments ordered by sequence
    async fn segments(&self, file_id: &str) -> Result<Vec<TranscriptSegment>, StoreError>;

    /// Remove every persisted segment of the file
    async fn clear_segments(&self, file_id: &str) -> Result<(), StoreError>;

    async fn segment_count(&self, file_id: &str) -> Result<usize, StoreError> {
        Ok(self.segments(file_id).await?.len())
    }
}

fn check_token(stored: &JobRecord, incoming: &JobRecord) -> Result<(), StoreError> {
    if stored.resume_token != incoming.resume_token {
        return Err(StoreError::StaleToken {
            file_id: incoming.file_id.clone(),
            held: incoming.resume_token,
            current: stored.resume_token,
        });
    }
    Ok(())
}

fn upsert_segments(existing: &mut Vec<TranscriptSegment>, segments: &[TranscriptSegment]) {
    for segment in segments {
        match existing.binary_search_by_key(&segment.sequence, |s| s.sequence) {
            Ok(index) => existing[index] = segment.clone(),
            Err(index) => existing.insert(index, segment.clone()),
        }
    }
}

/// File-backed store: one JSON document per file id under a data directory
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl FileCheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> io::Result<Self> {
        let dir = dir.into();
        file_utils::ensure_dir(&dir)?;
        Ok(Self {
            dir,
            locks: KeyedLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, file_id: &str) -> PathBuf {
        self.dir.join(file_utils::safe_file_name(file_id, "job.json"))
    }

    async fn read(&self, file_id: &str) -> Result<Option<StoredJob>, StoreError> {
        let path = self.path_for(file_id);
        let doc = tokio::task::spawn_blocking(move || file_utils::read_json::<StoredJob>(&path))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(doc)
    }

    async fn write(&self, doc: StoredJob) -> Result<(), StoreError> {
        let path = self.path_for(&doc.record.file_id);
        tokio::task::spawn_blocking(move || file_utils::write_json_atomic(&path, &doc))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(())
    }

    /// Read-modify-write of one document under its write lock
    async fn modify<F>(&self, file_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoredJob) -> Result<(), StoreError> + Send,
    {
        let _lock = self.locks.lock(file_id).await;
        let mut doc = self
            .read(file_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        f(&mut doc)?;
        self.write(doc).await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, file_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.read(file_id).await?.map(|doc| doc.record))
    }

    async fn snapshot(&self, file_id: &str) -> Result<Option<StoredJob>, StoreError> {
        self.read(file_id).await
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let dir = self.dir.clone();
        let docs = tokio::task::spawn_blocking(move || -> io::Result<Vec<StoredJob>> {
            let mut docs = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_job = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".job.json") && !n.starts_with('.'))
                    .unwrap_or(false);
                if is_job {
                    if let Some(doc) = file_utils::read_json::<StoredJob>(&path)? {
                        docs.push(doc);
                    }
                }
            }
            Ok(docs)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(docs.into_iter().map(|doc| doc.record).collect())
    }

    async fn create(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let _lock = self.locks.lock(&record.file_id).await;
        if self.read(&record.file_id).await?.is_some() {
            return Ok(false);
        }
        self.write(StoredJob {
            record: record.clone(),
            segments: Vec::new(),
        })
        .await?;
        debug!("Created job record for {}", record.file_id);
        Ok(true)
    }

    async fn put(&self, record: &JobRecord, clear_segments: bool) -> Result<(), StoreError> {
        let _lock = self.locks.lock(&record.file_id).await;
        let segments = if clear_segments {
            Vec::new()
        } else {
            self.read(&record.file_id)
                .await?
                .map(|doc| doc.segments)
                .unwrap_or_default()
        };
        self.write(StoredJob {
            record: record.clone(),
            segments,
        })
        .await
    }

    async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.modify(&record.file_id.clone(), move |doc| {
            check_token(&doc.record, &record)?;
            doc.record = record;
            Ok(())
        })
        .await
    }

    async fn save_segments(
        &self,
        record: &JobRecord,
        segments: &[TranscriptSegment],
    ) -> Result<(), StoreError> {
        let record = record.clone();
        let segments = segments.to_vec();
        self.modify(&record.file_id.clone(), move |doc| {
            check_token(&doc.record, &record)?;
            upsert_segments(&mut doc.segments, &segments);
            doc.record = record;
            Ok(())
        })
        .await
    }

    async fn segments(&self, file_id: &str) -> Result<Vec<TranscriptSegment>, StoreError> {
        Ok(self
            .read(file_id)
            .await?
            .map(|doc| doc.segments)
            .unwrap_or_default())
    }

    async fn clear_segments(&self, file_id: &str) -> Result<(), StoreError> {
        self.modify(file_id, |doc| {
            doc.segments.clear();
            Ok(())
        })
        .await
    }
}

/// In-process store, used by tests and by deployments without a data directory
#[derive(Default)]
pub struct MemoryCheckpointStore {
    docs: RwLock<HashMap<String, StoredJob>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, file_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.get(file_id).map(|doc| doc.record.clone()))
    }

    async fn snapshot(&self, file_id: &str) -> Result<Option<StoredJob>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.get(file_id).cloned())
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.values().map(|doc| doc.record.clone()).collect())
    }

    async fn create(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(&record.file_id) {
            return Ok(false);
        }
        docs.insert(
            record.file_id.clone(),
            StoredJob {
                record: record.clone(),
                segments: Vec::new(),
            },
        );
        Ok(true)
    }

    async fn put(&self, record: &JobRecord, clear_segments: bool) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .entry(record.file_id.clone())
            .or_insert_with(|| StoredJob {
                record: record.clone(),
                segments: Vec::new(),
            });
        doc.record = record.clone();
        if clear_segments {
            doc.segments.clear();
        }
        Ok(())
    }

    async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(&record.file_id)
            .ok_or_else(|| StoreError::NotFound(record.file_id.clone()))?;
        check_token(&doc.record, record)?;
        doc.record = record.clone();
        Ok(())
    }

    async fn save_segments(
        &self,
        record: &JobRecord,
        segments: &[TranscriptSegment],
    ) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(&record.file_id)
            .ok_or_else(|| StoreError::NotFound(record.file_id.clone()))?;
        check_token(&doc.record, record)?;
        upsert_segments(&mut doc.segments, segments);
        doc.record = record.clone();
        Ok(())
    }

    async fn segments(&self, file_id: &str) -> Result<Vec<TranscriptSegment>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .get(file_id)
            .map(|doc| doc.segments.clone())
            .unwrap_or_default())
    }

    async fn clear_segments(&self, file_id: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        doc.segments.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Checkpoint, JobStatus, ProcessedUnit, Stage};

    fn segment(sequence: u32) -> TranscriptSegment {
        TranscriptSegment {
            sequence,
            start: f64::from(sequence),
            end: f64::from(sequence) + 1.0,
            text: format!("segment {}", sequence),
            speaker: None,
        }
    }

    async fn exercise_store(store: &dyn CheckpointStore) {
        let record = JobRecord::new_pending("file-a");
        assert!(store.create(&record).await.unwrap());
        assert!(!store.create(&record).await.unwrap());

        // Orchestrator mints generation 1
        let mut live = record.clone();
        live.resume_token = ResumeToken(1);
        live.status = JobStatus::Processing;
        store.put(&live, false).await.unwrap();

        // Worker writes segments out of order, then rewrites one
        store
            .save_segments(&live, &[segment(1), segment(0)])
            .await
            .unwrap();
        let mut rewritten = segment(1);
        rewritten.text = "rewritten".to_string();
        store.save_segments(&live, &[rewritten]).await.unwrap();

        let segments = store.segments("file-a").await.unwrap();
        assert_eq!(segments.len(), 2);
        let snapshot = store.snapshot("file-a").await.unwrap().unwrap();
        assert_eq!(snapshot.record.resume_token, ResumeToken(1));
        assert_eq!(snapshot.segments.len(), 2);
        assert_eq!(segments[0].sequence, 0);
        assert_eq!(segments[1].text, "rewritten");

        // A stale generation is rejected and leaves everything untouched
        let mut stale = live.clone();
        stale.resume_token = ResumeToken(0);
        stale.progress = 0.9;
        let err = store.save(&stale).await.unwrap_err();
        assert!(err.is_stale());
        let err = store.save_segments(&stale, &[segment(7)]).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(store.segment_count("file-a").await.unwrap(), 2);
        assert_eq!(store.load("file-a").await.unwrap().unwrap().progress, 0.0);

        // A checkpoint lands as one update of the record
        let mut checkpointed = store.load("file-a").await.unwrap().unwrap();
        checkpointed.apply(&Checkpoint {
            stage: Stage::Transcribing,
            progress: 0.5,
            last_processed_unit: Some(ProcessedUnit::AudioOffset(12.5)),
            checkpoint_blob: Some(vec![1, 2, 3]),
        });
        store.save(&checkpointed).await.unwrap();
        let loaded = store.load("file-a").await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_blob, vec![1, 2, 3]);
        assert_eq!(
            loaded.last_processed_unit,
            Some(ProcessedUnit::AudioOffset(12.5))
        );
        assert_eq!(loaded.stage, Stage::Transcribing);
        assert_eq!(loaded.progress, 0.5);

        // Reset wipes segments in the same write
        let mut reset = loaded.clone();
        reset.status = JobStatus::Pending;
        reset.resume_token = ResumeToken(2);
        store.put(&reset, true).await.unwrap();
        assert_eq!(store.segment_count("file-a").await.unwrap(), 0);

        store.save_segments(&reset, &[segment(0)]).await.unwrap();
        store.clear_segments("file-a").await.unwrap();
        assert!(store.segments("file-a").await.unwrap().is_empty());

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.load("missing").await.unwrap().is_none());
        assert!(matches!(
            store.clear_segments("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryCheckpointStore::new();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("jobs")).unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = JobRecord::new_pending("file-b");
        record.resume_token = ResumeToken(4);
        record.recovery_attempts = 2;
        {
            let store = FileCheckpointStore::new(dir.path()).unwrap();
            store.create(&record).await.unwrap();
            store.save_segments(&record, &[segment(0)]).await.unwrap();
        }

        let reopened = FileCheckpointStore::new(dir.path()).unwrap();
        let loaded = reopened.load("file-b").await.unwrap().unwrap();
        assert_eq!(loaded.resume_token, ResumeToken(4));
        assert_eq!(loaded.recovery_attempts, 2);
        assert_eq!(reopened.segment_count("file-b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_store_keeps_lookalike_ids_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let ids = ["a b", "a/b", "a_b", ".", ".."];
        for id in ids {
            assert!(store.create(&JobRecord::new_pending(id)).await.unwrap());
        }

        assert_eq!(store.load("a_b").await.unwrap().unwrap().file_id, "a_b");
        assert_eq!(store.load("a/b").await.unwrap().unwrap().file_id, "a/b");
        let mut listed: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.file_id)
            .collect();
        listed.sort();
        let mut expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        expected.sort();
        assert_eq!(listed, expected);
        // Per-file locks do not outlive the calls that took them
        assert!(store.locks.is_empty());
    }
}
