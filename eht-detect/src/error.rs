//! HTTP error mapping for eht-detect

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use eht_common::error::ErrorKind;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or malformed caller identity (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed query string or body (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Error from the review engine, mapped by kind
    #[error(transparent)]
    Common(#[from] eht_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Common(ref err) => match err.kind() {
                ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
                ErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, "INVALID_INPUT", err.to_string()),
                ErrorKind::Internal => {
                    error!(error = %err, "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        err.to_string(),
                    )
                }
            },
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
