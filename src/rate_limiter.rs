use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::algorithms::{WindowOp, WindowOutcome};
use crate::error::{LimiterError, Result, StoreError};
use crate::key_generator::RateLimitKey;
use crate::rate_limit_config::RateWindowConfig;
use crate::store::{ScoreRange, ScoreStore};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Verdict of one admission check. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_ms: u64,
}

impl Decision {
    pub fn from_outcome(outcome: WindowOutcome, config: &RateWindowConfig, now_ms: u64) -> Self {
        match outcome {
            WindowOutcome::Admitted { prior_count } => Self {
                allowed: true,
                remaining: u64::from(config.max_requests())
                    .saturating_sub(prior_count + 1) as u32,
                retry_after_ms: 0,
            },
            WindowOutcome::Saturated { oldest_score, .. } => Self {
                allowed: false,
                remaining: 0,
                retry_after_ms: oldest_score.map_or(config.window_ms(), |oldest| {
                    (oldest + config.window_ms()).saturating_sub(now_ms)
                }),
            },
        }
    }
}

/// Live window occupancy for a key, read without admitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub used: u64,
    pub remaining: u64,
    pub limit: u32,
    pub window_ms: u64,
}

/// Distributed sliding-window limiter.
///
/// Holds no mutable state of its own; every check is one atomic
/// `execute_window` call against the shared store, bounded by a timeout.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn ScoreStore>,
    store_timeout: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self::with_timeout(store, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn ScoreStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Admit or refuse one request for `key` at `now_ms`.
    pub async fn check(
        &self,
        key: &RateLimitKey,
        config: &RateWindowConfig,
        now_ms: u64,
    ) -> Result<Decision> {
        let op = WindowOp::new(key, config, now_ms);
        let outcome = self.bounded(self.store.execute_window(&op)).await?;
        let decision = Decision::from_outcome(outcome, config, now_ms);

        debug!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            retry_after_ms = decision.retry_after_ms,
            "window check"
        );

        Ok(decision)
    }

    /// Prune expired entries and report occupancy without recording anything.
    pub async fn usage(
        &self,
        key: &RateLimitKey,
        config: &RateWindowConfig,
        now_ms: u64,
    ) -> Result<WindowUsage> {
        let window_start = now_ms.saturating_sub(config.window_ms());
        self.bounded(
            self.store
                .remove_range_by_score(key.as_str(), ScoreRange::below(window_start)),
        )
        .await?;
        let used = self.bounded(self.store.cardinality(key.as_str())).await?;

        Ok(WindowUsage {
            used,
            remaining: u64::from(config.max_requests()).saturating_sub(used),
            limit: config.max_requests(),
            window_ms: config.window_ms(),
        })
    }

    /// Forget every admission recorded for `key`.
    pub async fn reset(&self, key: &RateLimitKey) -> Result<()> {
        self.bounded(self.store.remove_set(key.as_str())).await?;
        debug!(key = %key, "window reset");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.bounded(self.store.ping()).await
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(LimiterError::StoreUnavailable(err)),
            Err(_) => Err(LimiterError::StoreUnavailable(StoreError::Timeout(
                self.store_timeout,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryScoreStore;
    use async_trait::async_trait;
    use tokio_test::assert_err;

    fn limiter() -> (SlidingWindowLimiter, Arc<MemoryScoreStore>) {
        let store = Arc::new(MemoryScoreStore::new());
        (SlidingWindowLimiter::new(store.clone()), store)
    }

    fn config(window_ms: i64, max_requests: i64) -> RateWindowConfig {
        RateWindowConfig::new("api", window_ms, max_requests).unwrap()
    }

    #[tokio::test]
    async fn test_exhausting_a_window() {
        let (limiter, _) = limiter();
        let key = RateLimitKey::new("api", "userA");
        let config = config(1000, 3);

        let mut remaining = Vec::new();
        for now in [0, 100, 200] {
            let decision = limiter.check(&key, &config, now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.retry_after_ms, 0);
            remaining.push(decision.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let refused = limiter.check(&key, &config, 300).await.unwrap();
        assert_eq!(
            refused,
            Decision {
                allowed: false,
                remaining: 0,
                retry_after_ms: 700
            }
        );
    }

    #[tokio::test]
    async fn test_window_slides_past_oldest_entry() {
        let (limiter, store) = limiter();
        let key = RateLimitKey::new("api", "userA");
        let config = config(1000, 3);

        for now in [0, 100, 200, 300] {
            limiter.check(&key, &config, now).await.unwrap();
        }

        let decision = limiter.check(&key, &config, 1001).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(store.first_score(key.as_str()).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_entry_at_window_start_survives() {
        let (limiter, _) = limiter();
        let key = RateLimitKey::new("api", "edge");
        let config = config(1000, 1);

        assert!(limiter.check(&key, &config, 0).await.unwrap().allowed);

        // window_start == 0 == score of the first entry: still counted
        let at_boundary = limiter.check(&key, &config, 1000).await.unwrap();
        assert!(!at_boundary.allowed);
        assert_eq!(at_boundary.retry_after_ms, 0);

        assert!(limiter.check(&key, &config, 1001).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_same_instant_checks_never_undercount() {
        let (limiter, _) = limiter();
        let key = RateLimitKey::new("api", "burst");
        let config = config(1000, 5);

        let first = limiter.check(&key, &config, 500).await.unwrap();
        let second = limiter.check(&key, &config, 500).await.unwrap();
        assert!(second.remaining < first.remaining);
        assert_eq!(first.remaining - second.remaining, 1);
    }

    #[tokio::test]
    async fn test_keys_do_not_share_budget() {
        let (limiter, _) = limiter();
        let config = config(1000, 2);
        let user_a = RateLimitKey::new("api", "userA");
        let user_b = RateLimitKey::new("api", "userB");

        for now in 0..3 {
            limiter.check(&user_a, &config, now).await.unwrap();
        }
        assert!(!limiter.check(&user_a, &config, 3).await.unwrap().allowed);

        let fresh = limiter.check(&user_b, &config, 3).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[tokio::test]
    async fn test_bound_holds_over_every_interval() {
        let (limiter, _) = limiter();
        let key = RateLimitKey::new("api", "property");
        let window_ms = 1000;
        let max_requests = 4;
        let config = config(window_ms as i64, max_requests as i64);

        // deterministic jittered arrivals, several per window
        let mut now = 0u64;
        let mut seed = 0x2545_f491u64;
        let mut admitted = Vec::new();
        for _ in 0..400 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            now += (seed >> 33) % 180;
            if limiter.check(&key, &config, now).await.unwrap().allowed {
                admitted.push(now);
            }
        }

        assert!(admitted.len() > max_requests);
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t <= start + window_ms)
                .count();
            // closed interval: the lower-edge entry is still live at start + window_ms
            assert!(in_window <= max_requests, "{} admissions from {}", in_window, start);
        }
    }

    #[tokio::test]
    async fn test_concurrent_checks_respect_budget() {
        let (limiter, _) = limiter();
        let key = RateLimitKey::new("api", "racer");
        let config = config(60_000, 10);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let key = key.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                limiter.check(&key, &config, 1_000).await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_usage_and_reset() {
        let (limiter, _) = limiter();
        let key = RateLimitKey::new("admin", "203.0.113.7");
        let config = config(1000, 3);

        limiter.check(&key, &config, 0).await.unwrap();
        limiter.check(&key, &config, 600).await.unwrap();

        let usage = limiter.usage(&key, &config, 700).await.unwrap();
        assert_eq!(usage.used, 2);
        assert_eq!(usage.remaining, 1);

        let later = limiter.usage(&key, &config, 1_200).await.unwrap();
        assert_eq!(later.used, 1);

        limiter.reset(&key).await.unwrap();
        let cleared = limiter.usage(&key, &config, 1_200).await.unwrap();
        assert_eq!(cleared.used, 0);
        assert_eq!(cleared.remaining, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_expires_idle_keys() {
        let (limiter, store) = limiter();
        let key = RateLimitKey::new("api", "idle");

        limiter.check(&key, &config(1000, 3), 0).await.unwrap();
        assert_eq!(store.cardinality(key.as_str()).await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(store.cardinality(key.as_str()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_pushes_expiry_back() {
        let (limiter, store) = limiter();
        let key = RateLimitKey::new("api", "active");
        let config = config(1000, 3);

        limiter.check(&key, &config, 0).await.unwrap();
        tokio::time::advance(Duration::from_millis(999)).await;
        limiter.check(&key, &config, 999).await.unwrap();

        // past the first admission's expiry, inside the second's
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(store.cardinality(key.as_str()).await.unwrap(), 2);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.cardinality(key.as_str()).await.unwrap(), 0);
    }

    #[test]
    fn test_retry_falls_back_to_window_without_oldest() {
        let config = config(60_000, 10);
        let decision = Decision::from_outcome(
            WindowOutcome::Saturated {
                count: 10,
                oldest_score: None,
            },
            &config,
            5_000,
        );
        assert_eq!(decision.retry_after_ms, 60_000);
    }

    struct BrokenStore;

    #[async_trait]
    impl ScoreStore for BrokenStore {
        async fn add_scored(&self, _: &str, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn remove_range_by_score(
            &self,
            _: &str,
            _: ScoreRange,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn cardinality(&self, _: &str) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn set_expiry(&self, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn first_score(&self, _: &str) -> std::result::Result<Option<u64>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn remove_set(&self, _: &str) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
        async fn execute_window(&self, _: &WindowOp) -> std::result::Result<WindowOutcome, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl ScoreStore for HangingStore {
        async fn add_scored(&self, _: &str, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            std::future::pending().await
        }
        async fn remove_range_by_score(
            &self,
            _: &str,
            _: ScoreRange,
        ) -> std::result::Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn cardinality(&self, _: &str) -> std::result::Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn set_expiry(&self, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            std::future::pending().await
        }
        async fn first_score(&self, _: &str) -> std::result::Result<Option<u64>, StoreError> {
            std::future::pending().await
        }
        async fn remove_set(&self, _: &str) -> std::result::Result<(), StoreError> {
            std::future::pending().await
        }
        async fn ping(&self) -> std::result::Result<(), StoreError> {
            std::future::pending().await
        }
        async fn execute_window(&self, _: &WindowOp) -> std::result::Result<WindowOutcome, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_store_errors_surface_as_unavailable() {
        let limiter = SlidingWindowLimiter::new(Arc::new(BrokenStore));
        let key = RateLimitKey::new("admin", "unknown");

        let err = assert_err!(limiter.check(&key, &config(1000, 3), 0).await);
        assert!(matches!(err, LimiterError::StoreUnavailable(StoreError::Backend(_))));
        assert!(limiter.ping().await.unwrap_err().is_store_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let limiter =
            SlidingWindowLimiter::with_timeout(Arc::new(HangingStore), Duration::from_millis(50));
        let key = RateLimitKey::new("api", "slow");

        let err = assert_err!(limiter.check(&key, &config(1000, 3), 0).await);
        assert!(matches!(
            err,
            LimiterError::StoreUnavailable(StoreError::Timeout(t)) if t == Duration::from_millis(50)
        ));
    }
}
