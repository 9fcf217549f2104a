use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::API_SCOPE;
use crate::error::{ApiError, LimiterError};
use crate::key_generator::{RateLimitKey, RequestContext};
use crate::middleware::AdmissionGate;
use crate::rate_limit_config::RateWindowConfig;
use crate::rate_limiter::SlidingWindowLimiter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub limiter: SlidingWindowLimiter,
    pub policies: Arc<HashMap<String, RateWindowConfig>>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        limiter: SlidingWindowLimiter,
        policies: Vec<RateWindowConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policies = policies
            .into_iter()
            .map(|policy| (policy.scope().to_string(), policy))
            .collect();

        Self {
            limiter,
            policies: Arc::new(policies),
            clock,
        }
    }

    pub fn policy(&self, scope: &str) -> Option<&RateWindowConfig> {
        self.policies.get(scope)
    }

    pub fn gate(&self, scope: &str) -> Result<AdmissionGate, LimiterError> {
        let config = self
            .policy(scope)
            .cloned()
            .ok_or_else(|| LimiterError::InvalidConfig(format!("no policy for scope '{}'", scope)))?;

        Ok(AdmissionGate::with_clock(
            self.limiter.clone(),
            config,
            self.clock.clone(),
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub key: RateLimitKey,
    pub limit: u32,
    pub used: u64,
    pub remaining: u64,
    pub window_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: String,
    pub message: String,
    pub key: RateLimitKey,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store_connected: bool,
}

async fn usage_for(
    state: &AppState,
    scope: &str,
    key: RateLimitKey,
) -> Result<UsageResponse, ApiError> {
    let config = state
        .policy(scope)
        .ok_or_else(|| ApiError::NotFound(format!("unknown scope '{}'", scope)))?;

    let usage = state
        .limiter
        .usage(&key, config, state.clock.now_ms())
        .await?;

    Ok(UsageResponse {
        key,
        limit: usage.limit,
        used: usage.used,
        remaining: usage.remaining,
        window_ms: usage.window_ms,
    })
}

/// Caller's own budget in the `api` scope
pub async fn own_usage(
    State(state): State<AppState>,
    context: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .policy(API_SCOPE)
        .ok_or_else(|| ApiError::Internal("api scope is not configured".to_string()))?;
    let key = RateLimitKey::build(API_SCOPE, config.key_strategy(), &context);

    Ok(Json(usage_for(&state, API_SCOPE, key).await?))
}

/// Usage of an arbitrary key
pub async fn get_usage(
    State(state): State<AppState>,
    Path((scope, identity)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = RateLimitKey::new(&scope, &identity);
    Ok(Json(usage_for(&state, &scope, key).await?))
}

/// Reset an arbitrary key
pub async fn reset_usage(
    State(state): State<AppState>,
    Path((scope, identity)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if state.policy(&scope).is_none() {
        return Err(ApiError::NotFound(format!("unknown scope '{}'", scope)));
    }

    let key = RateLimitKey::new(&scope, &identity);
    state.limiter.reset(&key).await?;

    Ok(Json(ResetResponse {
        status: "success".to_string(),
        message: "Rate limit window cleared".to_string(),
        key,
    }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_connected = state.limiter.ping().await.is_ok();

    Json(HealthResponse {
        status: if store_connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_connected,
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.limiter.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        // fail-open scopes keep serving, so the process stays ready
        Err(err) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "disconnected",
                "note": err.to_string()
            })),
        ),
    }
}
