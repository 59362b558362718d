//! Upload subsystem interface
//!
//! File ids and raw audio belong to the upload subsystem. The job engine only
//! needs to resolve a file id to an audio reference and, for batches, to ask for
//! chunk files carved out of a source file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::AudioRef;
use crate::file_utils;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Unknown file: {0}")]
    NotFound(String),
    #[error("Invalid upload: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An audio file known to the upload subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedFile {
    pub file_id: String,
    pub path: PathBuf,
    /// Duration in seconds of the audio this file stands for
    pub duration: f64,
    /// Window inside `path`, set for chunk files
    #[serde(default)]
    pub window: Option<(f64, f64)>,
    /// File this one was split from
    #[serde(default)]
    pub source_file_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl UploadedFile {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(file_id: S, path: P, duration: f64) -> Self {
        Self {
            file_id: file_id.into(),
            path: path.into(),
            duration,
            window: None,
            source_file_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn audio_ref(&self) -> AudioRef {
        match self.window {
            Some((start, end)) => AudioRef {
                path: self.path.clone(),
                start: Some(start),
                end: Some(end),
            },
            None => AudioRef::whole(&self.path),
        }
    }
}

#[async_trait]
pub trait UploadSubsystem: Send + Sync {
    async fn get(&self, file_id: &str) -> Result<Option<UploadedFile>, UploadError>;

    async fn register(&self, file: &UploadedFile) -> Result<(), UploadError>;

    /// Create a chunk file covering `[start, end)` of `source`
    async fn create_chunk(
        &self,
        source: &UploadedFile,
        index: usize,
        start: f64,
        end: f64,
    ) -> Result<UploadedFile, UploadError>;
}

/// Uploads described by `<file id>.upload.json` sidecars in one directory.
///
/// Chunks reference the source audio with a window instead of copying it.
pub struct DirectoryUploads {
    dir: PathBuf,
}

impl DirectoryUploads {
    pub fn new<P: Into<PathBuf>>(dir: P) -> io::Result<Self> {
        let dir = dir.into();
        file_utils::ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sidecar(&self, file_id: &str) -> PathBuf {
        self.dir.join(file_utils::safe_file_name(file_id, "upload.json"))
    }
}

#[async_trait]
impl UploadSubsystem for DirectoryUploads {
    async fn get(&self, file_id: &str) -> Result<Option<UploadedFile>, UploadError> {
        let path = self.sidecar(file_id);
        let file = tokio::task::spawn_blocking(move || file_utils::read_json::<UploadedFile>(&path))
            .await
            .map_err(|e| UploadError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        Ok(file)
    }

    async fn register(&self, file: &UploadedFile) -> Result<(), UploadError> {
        if file.file_id.trim().is_empty() {
            return Err(UploadError::Invalid("file id must not be empty".to_string()));
        }
        if !file.duration.is_finite() || file.duration < 0.0 {
            return Err(UploadError::Invalid(format!(
                "invalid duration {} for {}",
                file.duration, file.file_id
            )));
        }
        let path = self.sidecar(&file.file_id);
        let file = file.clone();
        tokio::task::spawn_blocking(move || file_utils::write_json_atomic(&path, &file))
            .await
            .map_err(|e| UploadError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        Ok(())
    }

    async fn create_chunk(
        &self,
        source: &UploadedFile,
        index: usize,
        start: f64,
        end: f64,
    ) -> Result<UploadedFile, UploadError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let chunk = UploadedFile {
            file_id: format!("{}-chunk{:03}-{}", source.file_id, index + 1, &suffix[..8]),
            path: source.path.clone(),
            duration: end - start,
            window: Some((start, end)),
            source_file_id: Some(source.file_id.clone()),
            created_at: Utc::now(),
        };
        self.register(&chunk).await?;
        info!(
            "Created chunk {} of {} covering {:.1}s-{:.1}s",
            chunk.file_id, source.file_id, start, end
        );
        Ok(chunk)
    }
}
