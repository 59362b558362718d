// API route handlers
//
// Thin layer over the orchestrator and batch coordinator: parse the request,
// dispatch, translate the outcome into a status code. Reads never write.

use actix_web::{get, post, web, HttpResponse};
use log::{error, info};
use std::sync::Arc;
use std::time::Instant;

use crate::batch::BatchCoordinator;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::models::{ActionResponse, BatchRequest, BatchResponse, RestartRequest, StartRequest};
use crate::orchestrator::{DispatchOutcome, Orchestrator, Request};

/// Status code for a dispatch outcome
fn outcome_response(file_id: &str, outcome: &DispatchOutcome) -> Result<HttpResponse, ApiError> {
    let body = ActionResponse::new(file_id, outcome);
    match outcome {
        DispatchOutcome::Started(_) | DispatchOutcome::Resumed(_) | DispatchOutcome::Queued(_) => {
            Ok(HttpResponse::Accepted().json(body))
        }
        DispatchOutcome::AlreadyRunning(_) => Ok(HttpResponse::Ok().json(body)),
        DispatchOutcome::AlreadyCompleted => Err(ApiError::AlreadyCompleted(file_id.to_string())),
    }
}

async fn dispatch(
    orchestrator: &Orchestrator,
    metrics: &Metrics,
    file_id: String,
    request: Request,
    endpoint: &str,
) -> Result<HttpResponse, ApiError> {
    let start_time = Instant::now();
    let result = match orchestrator.dispatch(&file_id, request).await {
        Ok(outcome) => {
            info!("{} {}: {}", endpoint, file_id, outcome.as_str());
            outcome_response(&file_id, &outcome)
        }
        Err(e) => {
            error!("{} {} failed: {}", endpoint, file_id, e);
            Err(ApiError::from(e))
        }
    };

    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => actix_web::ResponseError::status_code(e),
    };
    metrics
        .record_http_request(
            "POST",
            endpoint,
            status.as_str(),
            start_time.elapsed().as_secs_f64(),
        )
        .await;
    result
}

/// Current state of a job, polled by clients
#[get("/transcription/{file_id}")]
pub async fn job_status(
    file_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    let start_time = Instant::now();
    let view = orchestrator.status(&file_id).await?;

    metrics
        .record_http_request(
            "GET",
            "/transcription/{file_id}",
            "200",
            start_time.elapsed().as_secs_f64(),
        )
        .await;
    Ok(HttpResponse::Ok().json(view))
}

/// Persisted transcript segments in sequence order
#[get("/transcription/{file_id}/segments")]
pub async fn job_segments(
    file_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    let start_time = Instant::now();
    let segments = orchestrator.segments(&file_id).await?;

    metrics
        .record_http_request(
            "GET",
            "/transcription/{file_id}/segments",
            "200",
            start_time.elapsed().as_secs_f64(),
        )
        .await;
    Ok(HttpResponse::Ok().json(segments))
}

/// Start a job; `force` restarts a completed or running one
#[post("/transcription/{file_id}/start")]
pub async fn start_job(
    file_id: web::Path<String>,
    body: Option<web::Json<StartRequest>>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let config = body.config.merge_into(orchestrator.default_config());
    let request = Request::Start {
        config,
        force: body.force,
    };
    dispatch(
        &orchestrator,
        &metrics,
        file_id.into_inner(),
        request,
        "/transcription/{file_id}/start",
    )
    .await
}

/// Continue from the last checkpoint
#[post("/transcription/{file_id}/resume")]
pub async fn resume_job(
    file_id: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    dispatch(
        &orchestrator,
        &metrics,
        file_id.into_inner(),
        Request::Resume,
        "/transcription/{file_id}/resume",
    )
    .await
}

/// Discard all progress and start over; queued while the model is loading
#[post("/transcription/{file_id}/restart")]
pub async fn restart_job(
    file_id: web::Path<String>,
    body: Option<web::Json<RestartRequest>>,
    orchestrator: web::Data<Orchestrator>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let config = body.config.merge_into(orchestrator.default_config());
    dispatch(
        &orchestrator,
        &metrics,
        file_id.into_inner(),
        Request::ForceRestart { config },
        "/transcription/{file_id}/restart",
    )
    .await
}

/// Split a source file into chunk jobs
#[post("/batch")]
pub async fn create_batch(
    body: web::Json<BatchRequest>,
    orchestrator: web::Data<Orchestrator>,
    batches: web::Data<Arc<BatchCoordinator>>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    let start_time = Instant::now();
    let request = body.into_inner();
    let spec = request.chunk_spec();
    let config = request
        .config
        .map(|params| params.merge_into(orchestrator.default_config()));

    let record = batches
        .split_and_enqueue(&request.source_file_id, spec, request.auto_start, config)
        .await?;

    metrics
        .record_http_request("POST", "/batch", "201", start_time.elapsed().as_secs_f64())
        .await;
    Ok(HttpResponse::Created().json(BatchResponse {
        status_url: format!("/batch/{}", record.batch_id),
        batch_id: record.batch_id,
        chunk_file_ids: record.chunk_file_ids,
    }))
}

/// Batch record with chunk counts derived from the chunk jobs
#[get("/batch/{batch_id}")]
pub async fn batch_status(
    batch_id: web::Path<String>,
    batches: web::Data<Arc<BatchCoordinator>>,
    metrics: web::Data<Metrics>,
) -> Result<HttpResponse, ApiError> {
    let start_time = Instant::now();
    let status = batches.status(&batch_id).await?;

    metrics
        .record_http_request(
            "GET",
            "/batch/{batch_id}",
            "200",
            start_time.elapsed().as_secs_f64(),
        )
        .await;
    Ok(HttpResponse::Ok().json(status))
}

/// Exporter output for pull-based backends
#[get("/metrics")]
pub async fn metrics_endpoint(metrics: web::Data<Metrics>) -> HttpResponse {
    match metrics.export().await {
        Ok(data) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(data),
        Err(e) => HttpResponse::InternalServerError()
            .json(format!("Failed to export metrics: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use crate::checkpoint_store::MemoryCheckpointStore;
    use crate::engine::testing::{numbered_segments, FakeLoader, ScriptedTranscriber};
    use crate::model_cache::ModelCache;
    use crate::orchestrator::OrchestratorSettings;
    use crate::upload::{DirectoryUploads, UploadedFile};

    fn orchestrator(dir: &std::path::Path) -> Orchestrator {
        let loader = Arc::new(FakeLoader::new(ScriptedTranscriber::new(numbered_segments(2))));
        Orchestrator::new(
            Arc::new(MemoryCheckpointStore::default()),
            Arc::new(ModelCache::new(loader, Metrics::disabled())),
            Arc::new(DirectoryUploads::new(dir.join("uploads")).unwrap()),
            OrchestratorSettings::default(),
            Metrics::disabled(),
        )
    }

    #[actix_web::test]
    async fn test_start_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        orchestrator
            .register(&UploadedFile::new("talk", "/audio/talk.wav", 2.0))
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(orchestrator.clone()))
                .app_data(web::Data::new(Metrics::disabled()))
                .service(job_status)
                .service(start_job),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/transcription/talk/start")
            .set_json(serde_json::json!({ "language": "fr" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 202);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["action"], "started");
        assert_eq!(body["resume_token"], 1);

        let req = test::TestRequest::get().uri("/transcription/talk").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["file_id"], "talk");

        let req = test::TestRequest::get().uri("/transcription/ghost").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_invalid_batch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        orchestrator
            .register(&UploadedFile::new("talk", "/audio/talk.wav", 300.0))
            .await
            .unwrap();
        let batches =
            Arc::new(BatchCoordinator::new(orchestrator.clone(), None, 1, Metrics::disabled()).unwrap());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(orchestrator))
                .app_data(web::Data::new(batches))
                .app_data(web::Data::new(Metrics::disabled()))
                .service(create_batch)
                .service(batch_status),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/batch")
            .set_json(serde_json::json!({
                "source_file_id": "talk",
                "chunk_duration": 60,
                "overlap": 60
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);

        let req = test::TestRequest::post()
            .uri("/batch")
            .set_json(serde_json::json!({ "source_file_id": "talk", "chunk_duration": 120 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["chunk_file_ids"].as_array().unwrap().len(), 3);

        let req = test::TestRequest::get()
            .uri(&format!("/batch/{}", body["batch_id"].as_str().unwrap()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let status: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(status["counts"]["pending"], 3);
    }
}
