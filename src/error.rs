use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single call against the scored-set store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the limiter boundary.
///
/// Transport failures never leave the limiter raw: every [`StoreError`] is
/// wrapped in `StoreUnavailable` so callers only have to pick a fail policy.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl LimiterError {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, LimiterError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LimiterError>;

/// Errors returned by the service's own endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::InvalidConfig(msg) => ApiError::InvalidRequest(msg),
            LimiterError::StoreUnavailable(source) => ApiError::StoreUnavailable(source.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::InvalidRequest(msg) => Self::new("bad_request", msg, 400),
            ApiError::NotFound(msg) => Self::new("not_found", msg, 404),
            ApiError::StoreUnavailable(msg) => Self::new("service_unavailable", msg, 503),
            ApiError::Internal(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_api_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
