//! Scored-set store contract and the in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::debug;

use crate::algorithms::{run_window_steps, WindowOp, WindowOutcome};
use crate::error::StoreError;

/// Score bounds for range removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreRange {
    pub min: Bound<u64>,
    pub max: Bound<u64>,
}

impl ScoreRange {
    /// Everything scored strictly below `score`.
    pub fn below(score: u64) -> Self {
        Self {
            min: Bound::Unbounded,
            max: Bound::Excluded(score),
        }
    }

    pub fn contains(&self, score: u64) -> bool {
        (self.min, self.max).contains(&score)
    }

    /// `ZRANGEBYSCORE`-style `(min, max)` arguments.
    pub fn to_redis_args(&self) -> (String, String) {
        fn render(bound: Bound<u64>, infinity: &str) -> String {
            match bound {
                Bound::Unbounded => infinity.to_string(),
                Bound::Included(score) => score.to_string(),
                Bound::Excluded(score) => format!("({}", score),
            }
        }
        (render(self.min, "-inf"), render(self.max, "+inf"))
    }
}

/// Shared ordered-set store the limiter runs against.
///
/// Every method may fail or hang; the limiter bounds each call with a timeout
/// and treats any failure as the store being unavailable.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Add `member` with `score`; re-adding a member only updates its score.
    async fn add_scored(&self, set_name: &str, member: &str, score: u64) -> Result<(), StoreError>;

    /// Returns the number of members removed.
    async fn remove_range_by_score(
        &self,
        set_name: &str,
        range: ScoreRange,
    ) -> Result<u64, StoreError>;

    async fn cardinality(&self, set_name: &str) -> Result<u64, StoreError>;

    async fn set_expiry(&self, set_name: &str, ttl_ms: u64) -> Result<(), StoreError>;

    /// Lowest score in the set, if any.
    async fn first_score(&self, set_name: &str) -> Result<Option<u64>, StoreError>;

    async fn remove_set(&self, set_name: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Run the whole window check for one key as a single atomic unit.
    async fn execute_window(&self, op: &WindowOp) -> Result<WindowOutcome, StoreError>;
}

#[derive(Debug, Default)]
struct ScoredSet {
    by_score: BTreeSet<(u64, String)>,
    scores: HashMap<String, u64>,
    expires_at: Option<Instant>,
}

impl ScoredSet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn insert(&mut self, member: &str, score: u64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.by_score.remove(&(previous, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove_range(&mut self, range: ScoreRange) -> u64 {
        let doomed: Vec<(u64, String)> = self
            .by_score
            .iter()
            .take_while(|(score, _)| match range.max {
                Bound::Included(max) => *score <= max,
                Bound::Excluded(max) => *score < max,
                Bound::Unbounded => true,
            })
            .filter(|(score, _)| range.contains(*score))
            .cloned()
            .collect();

        for entry in &doomed {
            self.by_score.remove(entry);
            self.scores.remove(&entry.1);
        }
        doomed.len() as u64
    }
}

/// Single-process [`ScoreStore`].
///
/// Window checks are serialized per key with an async mutex. State is not
/// shared across processes, so multi-node deployments need the Redis store.
#[derive(Debug, Default)]
pub struct MemoryScoreStore {
    sets: DashMap<String, ScoredSet>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a background task calling [`purge_expired`] every `period`.
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    /// Must be called from within a tokio runtime.
    ///
    /// [`purge_expired`]: MemoryScoreStore::purge_expired
    pub fn with_sweeper(period: Duration) -> Arc<Self> {
        let store = Arc::new(Self::new());
        let weak = Arc::downgrade(&store);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
        });

        store
    }

    /// Number of live-or-expired sets currently held.
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Number of keys with a per-key lock allocated.
    pub fn lock_count(&self) -> usize {
        self.key_locks.len()
    }

    fn evict_if_expired(&self, set_name: &str) {
        let now = Instant::now();
        self.sets.remove_if(set_name, |_, set| set.is_expired(now));
    }

    /// Drop expired sets and per-key locks nobody is waiting on.
    ///
    /// Returns the number of sets removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sets.len();
        self.sets.retain(|_, set| !set.is_expired(now));
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let purged = before.saturating_sub(self.sets.len());
        if purged > 0 {
            debug!(purged, "purged expired window sets");
        }
        purged
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn add_scored(&self, set_name: &str, member: &str, score: u64) -> Result<(), StoreError> {
        self.evict_if_expired(set_name);
        self.sets
            .entry(set_name.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn remove_range_by_score(
        &self,
        set_name: &str,
        range: ScoreRange,
    ) -> Result<u64, StoreError> {
        self.evict_if_expired(set_name);
        let removed = match self.sets.get_mut(set_name) {
            Some(mut set) => set.remove_range(range),
            None => return Ok(0),
        };
        // an emptied set disappears, TTL included
        self.sets.remove_if(set_name, |_, set| set.scores.is_empty());
        Ok(removed)
    }

    async fn cardinality(&self, set_name: &str) -> Result<u64, StoreError> {
        self.evict_if_expired(set_name);
        Ok(self
            .sets
            .get(set_name)
            .map_or(0, |set| set.scores.len() as u64))
    }

    async fn set_expiry(&self, set_name: &str, ttl_ms: u64) -> Result<(), StoreError> {
        self.evict_if_expired(set_name);
        if let Some(mut set) = self.sets.get_mut(set_name) {
            set.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
        }
        Ok(())
    }

    async fn first_score(&self, set_name: &str) -> Result<Option<u64>, StoreError> {
        self.evict_if_expired(set_name);
        Ok(self
            .sets
            .get(set_name)
            .and_then(|set| set.by_score.iter().next().map(|(score, _)| *score)))
    }

    async fn remove_set(&self, set_name: &str) -> Result<(), StoreError> {
        self.sets.remove(set_name);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn execute_window(&self, op: &WindowOp) -> Result<WindowOutcome, StoreError> {
        let lock = Arc::clone(
            self.key_locks
                .entry(op.set_name.clone())
                .or_default()
                .value(),
        );
        let _guard = lock.lock().await;
        run_window_steps(self, op).await
    }
}
