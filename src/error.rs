// Error handling for the HTTP surface
//
// Lower layers have their own error enums; this module maps them onto
// HTTP responses with a JSON body.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::batch::BatchError;
use crate::checkpoint_store::StoreError;
use crate::models::ErrorResponse;
use crate::orchestrator::OrchestratorError;
use crate::upload::UploadError;

/// Errors returned by the route handlers
#[derive(Error, Debug)]
pub enum ApiError {
    /// Unknown file or batch
    #[error("{0}")]
    NotFound(String),

    /// Malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Completed jobs are only restarted with force
    #[error("Job {0} is already completed; use force to restart it")]
    AlreadyCompleted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_label(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::AlreadyCompleted(_) => "already_completed",
            ApiError::Storage(_) => "storage_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyCompleted(_) => StatusCode::CONFLICT,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            status: Some(self.status_label().to_string()),
        })
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("Unknown file: {}", id)),
            other => ApiError::Storage(other.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound(id) => ApiError::NotFound(format!("Unknown file: {}", id)),
            UploadError::Invalid(msg) => ApiError::InvalidRequest(msg),
            UploadError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(id) => ApiError::NotFound(format!("Unknown file: {}", id)),
            OrchestratorError::Store(e) => e.into(),
            OrchestratorError::Upload(e) => e.into(),
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::SourceNotFound(_) | BatchError::BatchNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            BatchError::InvalidChunkSpec(_) => ApiError::InvalidRequest(err.to_string()),
            BatchError::Upload(e) => e.into(),
            BatchError::Orchestrator(e) => e.into(),
            BatchError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err: ApiError = OrchestratorError::NotFound("a".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: ApiError = BatchError::InvalidChunkSpec("bad".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = ApiError::AlreadyCompleted("a".to_string());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ApiError = StoreError::Backend("disk full".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
