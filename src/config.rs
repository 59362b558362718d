// Transcription job service configuration
//
// Configuration structures and compiled defaults. Every value can be overridden
// from the environment; `config_loader` exports the TOML file into the
// environment before these structures are built.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::job::JobConfig;

/// Default values for configuration
pub mod defaults {
    // HTTP server
    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 8181;
    pub const TIMEOUT_SECONDS: u64 = 480;
    pub const KEEPALIVE_SECONDS: u64 = 480;
    // 0 means one worker per CPU
    pub const HTTP_WORKERS: usize = 0;

    // Storage
    pub const DATA_DIR: &str = "/var/lib/transcript_jobs/jobs";
    pub const UPLOAD_DIR: &str = "/var/lib/transcript_jobs/uploads";
    pub const WORK_DIR: &str = "/var/lib/transcript_jobs/work";

    // Engines
    pub const WHISPER_CMD: &str = "/opt/whisperx/whisperx.sh";
    pub const WHISPER_MODELS_DIR: &str = "/opt/whisperx/models";
    pub const HF_TOKEN_FILE: &str = "/opt/whisperx/hf_token.txt";
    pub const MODEL: &str = "large-v3";
    pub const DIARIZATION_MODEL: &str = "pyannote/speaker-diarization-3.1";
    pub const LANGUAGE: &str = "";
    pub const DEVICE: &str = "cuda";
    pub const DEVICE_INDEX: &str = "0";

    // Job lifecycle
    pub const STALL_THRESHOLD_SECONDS: u64 = 300;
    pub const CHECKPOINT_RETRY_ATTEMPTS: u32 = 3;
    pub const CHECKPOINT_RETRY_BACKOFF_MS: u64 = 200;
    pub const BATCH_START_CONCURRENCY: usize = 1;
    pub const RESUME_ON_STARTUP: bool = true;
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| String::from(default))
}

/// HTTP server settings
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub keepalive_seconds: u64,
    pub workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: env_string("JOBS_API_HOST", defaults::HOST),
            port: env_or("JOBS_API_PORT", defaults::PORT),
            timeout_seconds: env_or("JOBS_API_TIMEOUT", defaults::TIMEOUT_SECONDS),
            keepalive_seconds: env_or("JOBS_API_KEEPALIVE", defaults::KEEPALIVE_SECONDS),
            workers: env_or("JOBS_API_WORKERS", defaults::HTTP_WORKERS),
        }
    }
}

impl ServiceConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Number of HTTP workers, one per CPU unless configured
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// Job engine settings
#[derive(Clone, Debug)]
pub struct JobsConfig {
    /// Directory of Job Record documents
    pub data_dir: String,
    /// Directory of upload sidecars
    pub upload_dir: String,
    /// Scratch space for engine runs
    pub work_dir: String,
    pub whisper_command: String,
    pub models_dir: String,
    /// Diarization command, diarization is unavailable when empty
    pub diarize_command: String,
    pub hf_token_file: String,
    pub device: String,
    pub device_index: String,
    pub default_model: String,
    pub default_language: String,
    pub diarization_model: String,
    /// Seconds without progress before an active job is flagged stalled
    pub stall_threshold_seconds: u64,
    pub checkpoint_retry_attempts: u32,
    pub checkpoint_retry_backoff_ms: u64,
    /// Chunk jobs started at once by an auto-start batch
    pub batch_start_concurrency: usize,
    /// Resume jobs interrupted by a previous process on startup
    pub resume_on_startup: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            data_dir: env_string("JOBS_DATA_DIR", defaults::DATA_DIR),
            upload_dir: env_string("JOBS_UPLOAD_DIR", defaults::UPLOAD_DIR),
            work_dir: env_string("JOBS_WORK_DIR", defaults::WORK_DIR),
            whisper_command: env_string("WHISPER_CMD", defaults::WHISPER_CMD),
            models_dir: env_string("WHISPER_MODELS_DIR", defaults::WHISPER_MODELS_DIR),
            diarize_command: env_string("DIARIZE_CMD", ""),
            hf_token_file: env_string("WHISPER_HF_TOKEN_FILE", defaults::HF_TOKEN_FILE),
            device: env_string("WHISPER_DEVICE", defaults::DEVICE),
            device_index: env_string("WHISPER_DEVICE_INDEX", defaults::DEVICE_INDEX),
            default_model: env_string("WHISPER_MODEL", defaults::MODEL),
            default_language: env_string("WHISPER_LANGUAGE", defaults::LANGUAGE),
            diarization_model: env_string("DIARIZATION_MODEL", defaults::DIARIZATION_MODEL),
            stall_threshold_seconds: env_or(
                "JOBS_STALL_THRESHOLD_SECONDS",
                defaults::STALL_THRESHOLD_SECONDS,
            ),
            checkpoint_retry_attempts: env_or(
                "JOBS_CHECKPOINT_RETRY_ATTEMPTS",
                defaults::CHECKPOINT_RETRY_ATTEMPTS,
            ),
            checkpoint_retry_backoff_ms: env_or(
                "JOBS_CHECKPOINT_RETRY_BACKOFF_MS",
                defaults::CHECKPOINT_RETRY_BACKOFF_MS,
            ),
            batch_start_concurrency: env_or(
                "JOBS_BATCH_START_CONCURRENCY",
                defaults::BATCH_START_CONCURRENCY,
            ),
            resume_on_startup: env_or("RESUME_ON_STARTUP", defaults::RESUME_ON_STARTUP),
        }
    }
}

impl JobsConfig {
    /// Settings used when a request does not provide its own
    pub fn default_job_config(&self) -> JobConfig {
        JobConfig {
            model: self.default_model.clone(),
            language: self.default_language.clone(),
            diarize: !self.diarize_command.is_empty(),
            diarization_model: self.diarization_model.clone(),
            prompt: String::new(),
        }
    }

    pub fn batch_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("batches")
    }

    /// Read the HuggingFace token, `None` when the file is missing or empty
    pub fn load_hf_token(&self) -> Option<String> {
        std::fs::read_to_string(&self.hf_token_file)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    pub fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_threshold_seconds as i64)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.data_dir, &self.upload_dir, &self.work_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Configuration for metrics collection and export
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Type of metrics exporter ("prometheus", "statsd", "none")
    pub exporter_type: String,
    /// Endpoint for metrics exporter (if applicable)
    pub endpoint: Option<String>,
    /// Metrics prefix for all metrics (useful for StatsD)
    pub prefix: Option<String>,
    /// Sample rate for metrics (0.0 to 1.0, mainly for StatsD)
    pub sample_rate: Option<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let enabled = env_or("JOBS_METRICS_ENABLED", true);
        let exporter_type = if enabled {
            env::var("JOBS_METRICS_BACKEND")
                .or_else(|_| env::var("METRICS_BACKEND"))
                .unwrap_or_else(|_| "prometheus".to_string())
        } else {
            "none".to_string()
        };

        // STATSD_HOST/STATSD_PORT are used when no endpoint is given
        let endpoint = env::var("JOBS_METRICS_ENDPOINT")
            .or_else(|_| env::var("STATSD_ENDPOINT"))
            .ok()
            .or_else(|| {
                (exporter_type == "statsd").then(|| {
                    format!(
                        "{}:{}",
                        env_string("STATSD_HOST", "127.0.0.1"),
                        env_string("STATSD_PORT", "8125")
                    )
                })
            });

        Self {
            exporter_type,
            endpoint,
            prefix: env::var("JOBS_METRICS_PREFIX")
                .or_else(|_| env::var("STATSD_PREFIX"))
                .ok(),
            sample_rate: env::var("JOBS_METRICS_SAMPLE_RATE")
                .or_else(|_| env::var("STATSD_SAMPLE_RATE"))
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_job_config_follows_diarize_command() {
        let mut config = JobsConfig::default();
        config.diarize_command = String::new();
        config.default_model = "medium".to_string();
        let job = config.default_job_config();
        assert_eq!(job.model, "medium");
        assert!(!job.diarize);

        config.diarize_command = "/opt/diarize.sh".to_string();
        assert!(config.default_job_config().diarize);
    }

    #[test]
    fn test_worker_count() {
        let mut service = ServiceConfig::default();
        service.workers = 3;
        assert_eq!(service.worker_count(), 3);
        service.workers = 0;
        assert!(service.worker_count() >= 1);
    }
}
