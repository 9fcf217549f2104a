pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod key_generator;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod redis_store;
pub mod response;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{ApiError, LimiterError, Result, StoreError};
pub use key_generator::{KeyStrategy, RateLimitKey, RequestContext};
pub use middleware::{admission_middleware, protect, Admission, AdmissionGate};
pub use rate_limit_config::{FailPolicy, RateWindowConfig, RouteLimitSpec};
pub use rate_limiter::{Decision, SlidingWindowLimiter, WindowUsage};
pub use redis_store::RedisScoreStore;
pub use response::Rejection;
pub use server::create_app;
pub use store::{MemoryScoreStore, ScoreStore};
