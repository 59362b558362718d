// Transcription job lifecycle library
//
// Runs long speech-to-text jobs (model load, transcription, optional
// diarization, segment persistence) with durable checkpoints, crash recovery,
// force restarts that supersede running workers, and batch splitting of long
// recordings. The HTTP surface in `handlers` is a thin layer over
// `orchestrator::Orchestrator` and `batch::BatchCoordinator`.

pub mod batch;
pub mod checkpoint_store;
pub mod config;
pub mod config_loader;
pub mod config_validator;
pub mod engine;
pub mod error;
pub mod file_utils;
pub mod handlers;
pub mod job;
pub mod keyed_lock;
pub mod metrics;
pub mod model_cache;
pub mod models;
pub mod orchestrator;
pub mod stage_tracker;
pub mod status;
pub mod upload;

// Re-export common types for easier access
pub use batch::{BatchCoordinator, ChunkSpec};
pub use checkpoint_store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{JobsConfig, MetricsConfig, ServiceConfig};
pub use error::ApiError;
pub use job::{JobConfig, JobRecord, JobStatus, ResumeToken, Stage};
pub use metrics::Metrics;
pub use model_cache::ModelCache;
pub use orchestrator::{Action, DispatchOutcome, JobHandle, JobOutcome, Orchestrator};
pub use status::StatusView;
pub use upload::{DirectoryUploads, UploadSubsystem, UploadedFile};
