use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Script};
use tokio::sync::Mutex;
use tracing::warn;

use crate::algorithms::{WindowOp, WindowOutcome, SLIDING_WINDOW_SCRIPT};
use crate::error::StoreError;
use crate::store::{ScoreRange, ScoreStore};

pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";

/// [`ScoreStore`] backed by Redis sorted sets.
///
/// The multiplexed connection is opened lazily and dropped after a
/// connection-level failure, so the next call reconnects.
pub struct RedisScoreStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
    window_script: Script,
}

impl RedisScoreStore {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: key_prefix.into(),
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    fn set_key(&self, set_name: &str) -> String {
        format!("{}{}", self.key_prefix, set_name)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut connection_guard = self.connection.lock().await;

        if let Some(conn) = connection_guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *connection_guard = Some(conn.clone());
        Ok(conn)
    }

    async fn settle<T>(&self, result: RedisResult<T>) -> Result<T, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
                    warn!(error = %err, "dropping redis connection");
                    *self.connection.lock().await = None;
                }
                Err(StoreError::Redis(err))
            }
        }
    }
}

#[async_trait]
impl ScoreStore for RedisScoreStore {
    async fn add_scored(&self, set_name: &str, member: &str, score: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("ZADD")
            .arg(self.set_key(set_name))
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await;
        self.settle(result).await.map(|_| ())
    }

    async fn remove_range_by_score(
        &self,
        set_name: &str,
        range: ScoreRange,
    ) -> Result<u64, StoreError> {
        let (min, max) = range.to_redis_args();
        let mut conn = self.connection().await?;
        let result = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.set_key(set_name))
            .arg(min)
            .arg(max)
            .query_async::<_, u64>(&mut conn)
            .await;
        self.settle(result).await
    }

    async fn cardinality(&self, set_name: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("ZCARD")
            .arg(self.set_key(set_name))
            .query_async::<_, u64>(&mut conn)
            .await;
        self.settle(result).await
    }

    async fn set_expiry(&self, set_name: &str, ttl_ms: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("PEXPIRE")
            .arg(self.set_key(set_name))
            .arg(ttl_ms)
            .query_async::<_, i64>(&mut conn)
            .await;
        self.settle(result).await.map(|_| ())
    }

    async fn first_score(&self, set_name: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("ZRANGE")
            .arg(self.set_key(set_name))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async::<_, Vec<(String, f64)>>(&mut conn)
            .await;
        let entries = self.settle(result).await?;
        Ok(entries.first().map(|(_, score)| *score as u64))
    }

    async fn remove_set(&self, set_name: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("DEL")
            .arg(self.set_key(set_name))
            .query_async::<_, i64>(&mut conn)
            .await;
        self.settle(result).await.map(|_| ())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("PING").query_async::<_, String>(&mut conn).await;
        self.settle(result).await.map(|_| ())
    }

    async fn execute_window(&self, op: &WindowOp) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let result = self
            .window_script
            .key(self.set_key(&op.set_name))
            .arg(op.now_ms)
            .arg(op.window_start_ms)
            .arg(op.max_requests)
            .arg(op.ttl_ms)
            .arg(&op.member)
            .invoke_async::<_, Vec<i64>>(&mut conn)
            .await;
        let reply = self.settle(result).await?;
        parse_window_reply(&reply)
    }
}

fn parse_window_reply(reply: &[i64]) -> Result<WindowOutcome, StoreError> {
    let [admitted, count, oldest] = reply else {
        return Err(StoreError::Protocol(format!(
            "window script returned {} values, expected 3",
            reply.len()
        )));
    };

    let count = u64::try_from(*count)
        .map_err(|_| StoreError::Protocol(format!("negative set cardinality {}", count)))?;

    match *admitted {
        1 => Ok(WindowOutcome::Admitted { prior_count: count }),
        0 => Ok(WindowOutcome::Saturated {
            count,
            oldest_score: u64::try_from(*oldest).ok(),
        }),
        other => Err(StoreError::Protocol(format!(
            "window script returned admission flag {}",
            other
        ))),
    }
}
