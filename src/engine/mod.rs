//! Inference engine interfaces
//!
//! Speech-to-text and diarization engines are black boxes to the rest of the
//! crate: they accept an audio reference plus settings and either produce
//! segments / speaker labels or fail. Long-running calls report progress through
//! an unbounded channel so that the worker can turn events into checkpoints
//! without the engine ever touching the store.

pub mod command;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::job::{ErrorKind, JobConfig};

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    /// The requested variant cannot be loaded
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    /// The engine raised while running
    #[error("Inference failure: {0}")]
    InferenceFailure(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// A shared load hands the same error to every waiting caller
impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            EngineError::ModelUnavailable(msg) => EngineError::ModelUnavailable(msg.clone()),
            EngineError::InferenceFailure(msg) => EngineError::InferenceFailure(msg.clone()),
            EngineError::Io(e) => EngineError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl EngineError {
    /// Error kind recorded on the job when this error ends a worker
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            EngineError::InferenceFailure(_) | EngineError::Io(_) => ErrorKind::InferenceFailure,
        }
    }
}

/// Audio to process: a file, optionally restricted to a time window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioRef {
    pub path: PathBuf,
    /// Window start in seconds
    #[serde(default)]
    pub start: Option<f64>,
    /// Window end in seconds
    #[serde(default)]
    pub end: Option<f64>,
}

impl AudioRef {
    pub fn whole<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            start: None,
            end: None,
        }
    }
}

/// Everything a speech-to-text engine needs for one run
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub file_id: String,
    pub audio: AudioRef,
    pub config: JobConfig,
    /// Skip audio before this offset (seconds); set when resuming
    pub resume_from: Option<f64>,
    /// Engine state saved by a previous attempt, empty when none
    pub checkpoint_blob: Vec<u8>,
}

/// Progress signal emitted by an engine while it runs
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Fraction (0.0 to 1.0) of the current step done
    Progress(f64),
    /// Engine state that allows continuing from `offset` without recompute
    Checkpoint { offset: f64, blob: Vec<u8> },
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Transcribed unit as produced by an engine, before sequencing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        request: &TranscribeRequest,
        events: EventSender,
    ) -> Result<Vec<RawSegment>, EngineError>;
}

#[async_trait]
pub trait Diarizer: Send + Sync {
    /// One speaker label per input segment
    async fn diarize(
        &self,
        audio: &AudioRef,
        segments: &[RawSegment],
        events: EventSender,
    ) -> Result<Vec<Option<String>>, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Transcriber,
    Diarizer,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Transcriber => "transcriber",
            EngineKind::Diarizer => "diarizer",
        }
    }
}

/// Cache key: engine type plus model variant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub kind: EngineKind,
    pub variant: String,
}

impl EngineKey {
    pub fn transcriber<S: Into<String>>(variant: S) -> Self {
        Self {
            kind: EngineKind::Transcriber,
            variant: variant.into(),
        }
    }

    pub fn diarizer<S: Into<String>>(variant: S) -> Self {
        Self {
            kind: EngineKind::Diarizer,
            variant: variant.into(),
        }
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.variant)
    }
}

/// A loaded engine instance, shared by every job using the same key
#[derive(Clone)]
pub enum LoadedEngine {
    Transcriber(Arc<dyn Transcriber>),
    Diarizer(Arc<dyn Diarizer>),
}

/// Callback receiving the fraction of weights loaded
pub type LoadProgress<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Loads engine instances; the expensive step the model cache shares
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(
        &self,
        key: &EngineKey,
        progress: LoadProgress<'_>,
    ) -> Result<LoadedEngine, EngineError>;
}
