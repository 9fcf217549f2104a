use axum::http::header::{HeaderName, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Why a gate refused a request without running its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Budget exhausted for the caller's key.
    RateLimited {
        scope: String,
        limit: u32,
        retry_after_ms: u64,
    },
    /// Store unreachable and the scope fails closed.
    StoreUnavailable { scope: String },
}

#[derive(Debug, Serialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// `Retry-After` carries whole seconds; round up so clients never retry early.
pub fn retry_after_secs(retry_after_ms: u64) -> u64 {
    retry_after_ms.div_ceil(1000)
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::RateLimited {
                scope,
                limit,
                retry_after_ms,
            } => {
                let body = RejectionBody {
                    error: "rate_limit_exceeded".to_string(),
                    message: format!("Too many requests for scope '{}'", scope),
                    code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                    retry_after_ms: Some(retry_after_ms),
                };

                let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = resp.headers_mut();
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after_ms)));
                headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
                headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u32));
                resp
            }
            Rejection::StoreUnavailable { scope } => {
                let body = RejectionBody {
                    error: "service_unavailable".to_string(),
                    message: format!(
                        "Rate limiting for scope '{}' is temporarily unavailable",
                        scope
                    ),
                    code: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                    retry_after_ms: None,
                };
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
        }
    }
}
