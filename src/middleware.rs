use axum::extract::{Request, State};
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::key_generator::{RateLimitKey, RequestContext};
use crate::rate_limit_config::{FailPolicy, RateWindowConfig};
use crate::rate_limiter::{Decision, SlidingWindowLimiter};
use crate::response::Rejection;

/// Terminal state of one gated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Forwarded(Decision),
    Rejected(Rejection),
    /// Store unreachable, scope fails open.
    DegradedForward,
}

/// A limiter bound to one route policy.
#[derive(Clone)]
pub struct AdmissionGate {
    limiter: SlidingWindowLimiter,
    config: Arc<RateWindowConfig>,
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    pub fn new(limiter: SlidingWindowLimiter, config: RateWindowConfig) -> Self {
        Self::with_clock(limiter, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        limiter: SlidingWindowLimiter,
        config: RateWindowConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn config(&self) -> &RateWindowConfig {
        &self.config
    }

    /// Decide the fate of a request. Never invokes the handler itself.
    pub async fn evaluate(&self, context: &RequestContext) -> Admission {
        let config = self.config.as_ref();
        let key = RateLimitKey::build(config.scope(), config.key_strategy(), context);
        let now_ms = self.clock.now_ms();

        match self.limiter.check(&key, config, now_ms).await {
            Ok(decision) if decision.allowed => Admission::Forwarded(decision),
            Ok(decision) => {
                info!(
                    key = %key,
                    retry_after_ms = decision.retry_after_ms,
                    "request rate limited"
                );
                Admission::Rejected(Rejection::RateLimited {
                    scope: config.scope().to_string(),
                    limit: config.max_requests(),
                    retry_after_ms: decision.retry_after_ms,
                })
            }
            Err(err) => match config.fail_policy() {
                FailPolicy::Open => {
                    warn!(key = %key, error = %err, "rate limit store degraded, failing open");
                    Admission::DegradedForward
                }
                FailPolicy::Closed => {
                    warn!(key = %key, error = %err, "rate limit store degraded, failing closed");
                    Admission::Rejected(Rejection::StoreUnavailable {
                        scope: config.scope().to_string(),
                    })
                }
            },
        }
    }
}

/// Gate middleware; install with `from_fn_with_state(gate, admission_middleware)`.
pub async fn admission_middleware(
    State(gate): State<AdmissionGate>,
    request: Request,
    next: Next,
) -> Response {
    let context = RequestContext::from_parts(request.headers(), request.extensions());

    match gate.evaluate(&context).await {
        Admission::Forwarded(decision) => {
            debug!(
                scope = gate.config().scope(),
                remaining = decision.remaining,
                "request admitted"
            );
            next.run(request).await
        }
        Admission::DegradedForward => next.run(request).await,
        Admission::Rejected(rejection) => rejection.into_response(),
    }
}

/// Put every route currently in `router` behind `gate`.
pub fn protect<S>(router: Router<S>, gate: AdmissionGate) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(axum_middleware::from_fn_with_state(gate, admission_middleware))
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_address =
        RequestContext::from_parts(request.headers(), request.extensions()).client_address();

    info!(
        method = %method,
        uri = %uri,
        client_address = %client_address,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}
