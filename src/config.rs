use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::LimiterError;
use crate::rate_limit_config::{FailPolicy, RateWindowConfig};

pub const API_SCOPE: &str = "api";
pub const ADMIN_SCOPE: &str = "admin";

/// Service configuration. Only the binary reads this; the limiter core takes
/// everything as explicit arguments.
#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL
    #[envconfig(from = "REDIS_URL", default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Namespace prepended to every window key in Redis
    #[envconfig(from = "REDIS_KEY_PREFIX", default = "rate_limit:")]
    pub redis_key_prefix: String,

    /// Upper bound on any single store call
    #[envconfig(from = "STORE_TIMEOUT_MS", default = "250")]
    pub store_timeout_ms: u64,

    #[envconfig(from = "API_WINDOW_MS", default = "60000")]
    pub api_window_ms: i64,

    #[envconfig(from = "API_MAX_REQUESTS", default = "50")]
    pub api_max_requests: i64,

    #[envconfig(from = "ADMIN_WINDOW_MS", default = "60000")]
    pub admin_window_ms: i64,

    #[envconfig(from = "ADMIN_MAX_REQUESTS", default = "10")]
    pub admin_max_requests: i64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), LimiterError> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(LimiterError::InvalidConfig(
                "REDIS_URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        if self.store_timeout_ms == 0 {
            return Err(LimiterError::InvalidConfig(
                "STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        self.route_policies().map(|_| ())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// `api` stays available when the store is down; `admin` does not.
    pub fn route_policies(&self) -> Result<Vec<RateWindowConfig>, LimiterError> {
        Ok(vec![
            RateWindowConfig::new(API_SCOPE, self.api_window_ms, self.api_max_requests)?
                .with_fail_policy(FailPolicy::Open),
            RateWindowConfig::new(ADMIN_SCOPE, self.admin_window_ms, self.admin_max_requests)?
                .with_fail_policy(FailPolicy::Closed),
        ])
    }
}
