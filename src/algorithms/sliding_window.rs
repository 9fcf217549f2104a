//! Sliding log window.
//!
//! Every admitted request is a member of the key's scored set, scored with
//! its admission time in milliseconds. A check prunes members older than the
//! window, counts the rest, and only records itself when the count is still
//! below the budget. Any `window_ms`-wide interval therefore holds at most
//! `max_requests` admissions, whatever its phase.

use uuid::Uuid;

use crate::error::StoreError;
use crate::key_generator::RateLimitKey;
use crate::rate_limit_config::RateWindowConfig;
use crate::store::{ScoreRange, ScoreStore};

/// One admission check, fully resolved before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOp {
    pub set_name: String,
    pub now_ms: u64,
    /// Members scored strictly below this are expired.
    pub window_start_ms: u64,
    pub max_requests: u32,
    pub ttl_ms: u64,
    pub member: String,
}

impl WindowOp {
    pub fn new(key: &RateLimitKey, config: &RateWindowConfig, now_ms: u64) -> Self {
        Self {
            set_name: key.as_str().to_string(),
            now_ms,
            window_start_ms: now_ms.saturating_sub(config.window_ms()),
            max_requests: config.max_requests(),
            ttl_ms: config.window_ms(),
            // unique per admission; adds are idempotent by member
            member: format!("{}-{}", now_ms, Uuid::new_v4()),
        }
    }
}

/// What the store observed while running a [`WindowOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Entry recorded; `prior_count` live entries existed before it.
    Admitted { prior_count: u64 },
    /// Budget exhausted, nothing recorded.
    Saturated {
        count: u64,
        oldest_score: Option<u64>,
    },
}

/// Runs the four window steps through the store primitives.
///
/// Not atomic on its own: callers must hold whatever per-key exclusion the
/// store provides for the whole call.
pub async fn run_window_steps<S>(store: &S, op: &WindowOp) -> Result<WindowOutcome, StoreError>
where
    S: ScoreStore + ?Sized,
{
    store
        .remove_range_by_score(&op.set_name, ScoreRange::below(op.window_start_ms))
        .await?;

    let count = store.cardinality(&op.set_name).await?;

    if count < u64::from(op.max_requests) {
        store.add_scored(&op.set_name, &op.member, op.now_ms).await?;
        store.set_expiry(&op.set_name, op.ttl_ms).await?;
        return Ok(WindowOutcome::Admitted { prior_count: count });
    }

    let oldest_score = store.first_score(&op.set_name).await?;
    Ok(WindowOutcome::Saturated {
        count,
        oldest_score,
    })
}

/// Server-side rendition of [`run_window_steps`] for Redis.
///
/// KEYS[1] set name; ARGV: now, window start, max requests, ttl ms, member.
/// Returns `{admitted, count, oldest_score_or_-1}`.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local max_requests = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[2])
local count = redis.call('ZCARD', key)

if count < max_requests then
    redis.call('ZADD', key, now, ARGV[5])
    redis.call('PEXPIRE', key, ARGV[4])
    return {1, count, -1}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    return {0, count, tonumber(oldest[2])}
end
return {0, count, -1}
"#;
