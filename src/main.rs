use actix_web::{middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use futures::future::join_all;
use log::{error, info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use transcript_jobs::config_loader::load_config;
use transcript_jobs::config_validator::ConfigValidator;
use transcript_jobs::engine::command::{CommandEngineConfig, CommandEngineLoader};
use transcript_jobs::handlers::{
    batch_status, create_batch, job_segments, job_status, metrics_endpoint, restart_job,
    resume_job, start_job,
};
use transcript_jobs::metrics::create_metrics_exporter;
use transcript_jobs::orchestrator::OrchestratorSettings;
use transcript_jobs::{
    BatchCoordinator, DirectoryUploads, FileCheckpointStore, JobOutcome, JobsConfig, Metrics,
    MetricsConfig, ModelCache, Orchestrator, ServiceConfig,
};

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // File values are exported to the environment before anything reads it
    load_config();
    if ConfigValidator::validate().is_err() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid configuration, see errors above",
        ));
    }

    let service_config = ServiceConfig::default();
    let jobs_config = JobsConfig::default();
    let metrics_config = MetricsConfig::default();

    let exporter = create_metrics_exporter(
        &metrics_config.exporter_type,
        metrics_config.endpoint.as_deref(),
        metrics_config.prefix.as_deref(),
        metrics_config.sample_rate,
    )
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let metrics = Metrics::new(exporter);

    jobs_config.ensure_dirs()?;
    let store = Arc::new(FileCheckpointStore::new(&jobs_config.data_dir)?);
    let uploads = Arc::new(DirectoryUploads::new(&jobs_config.upload_dir)?);

    let hf_token = jobs_config.load_hf_token();
    if !jobs_config.diarize_command.is_empty() && hf_token.is_none() {
        warn!(
            "Diarization enabled but no HuggingFace token found in {}",
            jobs_config.hf_token_file
        );
    }
    let loader = Arc::new(CommandEngineLoader::new(CommandEngineConfig {
        whisper_command: jobs_config.whisper_command.clone(),
        models_dir: jobs_config.models_dir.clone(),
        work_dir: PathBuf::from(&jobs_config.work_dir),
        diarize_command: Some(jobs_config.diarize_command.clone()).filter(|c| !c.is_empty()),
        hf_token,
        device: jobs_config.device.clone(),
        device_index: jobs_config.device_index.clone(),
    }));
    let models = Arc::new(ModelCache::new(loader, metrics.clone()));

    let orchestrator = Orchestrator::new(
        store,
        models,
        uploads,
        OrchestratorSettings::from_config(&jobs_config),
        metrics.clone(),
    );
    let batches = Arc::new(BatchCoordinator::new(
        orchestrator.clone(),
        Some(jobs_config.batch_dir()),
        jobs_config.batch_start_concurrency,
        metrics.clone(),
    )?);

    if jobs_config.resume_on_startup {
        match orchestrator.recover_interrupted().await {
            Ok(handles) if !handles.is_empty() => {
                tokio::spawn(async move {
                    let outcomes = join_all(handles.into_iter().map(|h| h.wait())).await;
                    let completed = outcomes
                        .iter()
                        .filter(|o| **o == JobOutcome::Completed)
                        .count();
                    info!(
                        "Recovered jobs finished: {} of {} completed",
                        completed,
                        outcomes.len()
                    );
                });
            }
            Ok(_) => info!("No interrupted jobs to resume"),
            Err(e) => error!("Crash recovery failed: {}", e),
        }
    }

    info!(
        "Starting transcription job server on http://{}",
        service_config.bind_address()
    );
    info!("Job records: {}", jobs_config.data_dir);
    info!("Uploads: {}", jobs_config.upload_dir);
    info!("WhisperX command: {}", jobs_config.whisper_command);
    info!("WhisperX models directory: {}", jobs_config.models_dir);
    info!("Metrics exporter: {}", metrics_config.exporter_type);

    let workers = service_config.worker_count();
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(orchestrator.clone()))
            .app_data(web::Data::new(batches.clone()))
            .app_data(web::Data::new(metrics.clone()))
            .service(metrics_endpoint)
            .service(job_status)
            .service(job_segments)
            .service(start_job)
            .service(resume_job)
            .service(restart_job)
            .service(create_batch)
            .service(batch_status)
    })
    .workers(workers)
    .bind(service_config.bind_address())?
    .client_disconnect_timeout(Duration::from_secs(service_config.timeout_seconds))
    .keep_alive(Duration::from_secs(service_config.keepalive_seconds))
    .run()
    .await
}
