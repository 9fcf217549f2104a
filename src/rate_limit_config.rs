use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::Validate;

use crate::error::{LimiterError, Result};
use crate::key_generator::KeyStrategy;

/// Scopes never contain `:`, so `"<scope>:<identity>"` splits unambiguously.
static SCOPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("scope pattern is valid"));

/// What a gate does when the store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Forward the request and log the degradation.
    #[default]
    Open,
    /// Reject with a service-unavailable response.
    Closed,
}

/// Declarative per-route policy, as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RouteLimitSpec {
    #[validate(regex(
        path = *SCOPE_PATTERN,
        message = "scope must be 1-64 characters of [A-Za-z0-9_-]"
    ))]
    pub scope: String,

    #[validate(range(min = 1, message = "windowMs must be greater than 0"))]
    pub window_ms: i64,

    #[validate(range(min = 1, message = "maxRequests must be greater than 0"))]
    pub max_requests: i64,

    #[serde(default)]
    pub fail_policy: FailPolicy,

    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

/// Immutable sliding-window policy for one protected route scope.
///
/// Only constructible through validation, so a zero window or a zero budget
/// can never reach request time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindowConfig {
    scope: String,
    window_ms: u64,
    max_requests: u32,
    fail_policy: FailPolicy,
    key_strategy: KeyStrategy,
}

impl RateWindowConfig {
    /// Build a fail-open, client-address keyed policy.
    pub fn new(scope: impl Into<String>, window_ms: i64, max_requests: i64) -> Result<Self> {
        RouteLimitSpec {
            scope: scope.into(),
            window_ms,
            max_requests,
            fail_policy: FailPolicy::Open,
            key_strategy: KeyStrategy::ClientAddress,
        }
        .try_into()
    }

    pub fn with_fail_policy(mut self, fail_policy: FailPolicy) -> Self {
        self.fail_policy = fail_policy;
        self
    }

    pub fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }
}

impl TryFrom<RouteLimitSpec> for RateWindowConfig {
    type Error = LimiterError;

    fn try_from(route: RouteLimitSpec) -> Result<Self> {
        route
            .validate()
            .map_err(|e| LimiterError::InvalidConfig(e.to_string()))?;

        let window_ms = u64::try_from(route.window_ms)
            .map_err(|_| LimiterError::InvalidConfig("windowMs out of range".to_string()))?;
        let max_requests = u32::try_from(route.max_requests)
            .map_err(|_| LimiterError::InvalidConfig("maxRequests out of range".to_string()))?;

        Ok(Self {
            scope: route.scope,
            window_ms,
            max_requests,
            fail_policy: route.fail_policy,
            key_strategy: route.key_strategy,
        })
    }
}
