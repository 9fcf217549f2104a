use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::clock::SystemClock;
use crate::config::{Config, ADMIN_SCOPE, API_SCOPE};
use crate::error::LimiterError;
use crate::handlers::{
    get_usage, health_check, own_usage, readiness_check, reset_usage, AppState,
};
use crate::middleware::{logging_middleware, protect};
use crate::rate_limiter::SlidingWindowLimiter;
use crate::redis_store::RedisScoreStore;

/// Build the router: open health probes, `api` routes behind the fail-open
/// gate, `admin` routes behind the fail-closed one.
pub fn create_app(state: AppState) -> Result<Router, LimiterError> {
    let api_routes = protect(
        Router::new().route("/api/rate-limits/self", get(own_usage)),
        state.gate(API_SCOPE)?,
    );

    let admin_routes = protect(
        Router::new().route(
            "/admin/rate-limits/:scope/:identity",
            get(get_usage).delete(reset_usage),
        ),
        state.gate(ADMIN_SCOPE)?,
    );

    Ok(Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(api_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        ))
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, LimiterError> {
        config.validate()?;

        let store = RedisScoreStore::new(&config.redis_url, config.redis_key_prefix.clone())
            .map_err(|e| LimiterError::InvalidConfig(e.to_string()))?;
        let limiter = SlidingWindowLimiter::with_timeout(Arc::new(store), config.store_timeout());
        let state = AppState::new(limiter, config.route_policies()?, Arc::new(SystemClock));

        Ok(Self {
            app: create_app(state)?,
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("quest-throttle listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
