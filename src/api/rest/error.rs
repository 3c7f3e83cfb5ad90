use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::error;

use crate::controller::LabError;

#[derive(Debug)]
pub enum ApiError {
    Lab(LabError),
    BadRequest(String),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

fn lab_status(err: &LabError) -> StatusCode {
    match err {
        LabError::RuntimeUnavailable(_) | LabError::PortExhausted { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LabError::NotFound(_) => StatusCode::NOT_FOUND,
        LabError::AccessDenied { .. }
        | LabError::QuotaExceeded { .. }
        | LabError::RuntimeExceeded { .. } => StatusCode::FORBIDDEN,
        LabError::ResourceUnavailable(_) => StatusCode::CONFLICT,
        LabError::InvalidEnvironmentType(_)
        | LabError::InvalidTemplate(_)
        | LabError::InvalidQuota(_)
        | LabError::InvalidState { .. } => StatusCode::BAD_REQUEST,
        LabError::RuntimeOperationFailed(_) | LabError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Lab(e) => (lab_status(&e), e.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, message);
        }
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<LabError> for ApiError {
    fn from(e: LabError) -> Self {
        ApiError::Lab(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}
