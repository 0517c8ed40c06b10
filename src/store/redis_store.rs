//! # Redis Store
//!
//! [`KvStore`] backed by Redis through a multiplexed `ConnectionManager`, which
//! reconnects on its own after connection loss. Every command is bounded by the
//! configured operation timeout so an unreachable server surfaces as an error
//! instead of a hung request.

use super::{
    IndexedWrite, KvStore, StoreError, StoreResult, TokenBucketOutcome, TokenBucketParams,
};
use crate::core::config::StoreConfig;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};

/// Lua twin of `token_bucket_step`
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local interval_ms = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now_ms
end

local elapsed = math.max(0, now_ms - last_refill)
local added = math.floor(elapsed * refill_rate / interval_ms)
if added > 0 then
  tokens = math.min(capacity, tokens + added)
  if tokens >= capacity then
    last_refill = now_ms
  else
    last_refill = last_refill + math.floor(added * interval_ms / refill_rate)
  end
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last_refill)
redis.call('PEXPIRE', key, ttl_ms)
return {allowed, tokens}
"#;

const SCAN_BATCH: usize = 500;

/// Redis store implementation
pub struct RedisStore {
    manager: ConnectionManager,
    op_timeout: Duration,
    token_bucket: Script,
}

impl RedisStore {
    /// Connect using the store section of the configuration
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;

        let manager = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connection_timeout))??;

        info!(url = %config.redis_url, "Redis store connected");

        Ok(Self {
            manager,
            op_timeout: config.connection_timeout,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, f(self.manager.clone())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, error = %e, "Redis operation failed");
                Err(e.into())
            }
            Err(_) => {
                error!(operation, timeout = ?self.op_timeout, "Redis operation timed out");
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run("ping", |mut conn| async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await.map(|_| ())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run("get", |mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.run("set", |mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_ms(ttl));
            }
            cmd.query_async(&mut conn).await
        })
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.run("del", |mut conn| async move {
            redis::cmd("DEL")
                .arg(key)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|n| n > 0)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.run("expire", |mut conn| async move {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms(ttl))
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|n| n == 1)
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.run("zadd", |mut conn| async move {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.run("zrangebyscore", |mut conn| async move {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrevrange(&self, key: &str, limit: Option<usize>) -> StoreResult<Vec<String>> {
        let stop: i64 = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => n as i64 - 1,
            None => -1,
        };
        self.run("zrevrange", |mut conn| async move {
            redis::cmd("ZREVRANGE")
                .arg(key)
                .arg(0)
                .arg(stop)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.run("zrem", |mut conn| async move {
            redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.run("sadd", |mut conn| async move {
            redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.run("srem", |mut conn| async move {
            redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await
        })
        .await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run("smembers", |mut conn| async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let pattern = format!("{}*", prefix);
        self.run("scan", |mut conn| async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
        .await
    }

    async fn write_indexed(&self, write: &IndexedWrite) -> StoreResult<()> {
        self.run("write_indexed", |mut conn| async move {
            let mut pipe = redis::pipe();
            pipe.atomic();

            let set = pipe.cmd("SET").arg(&write.key).arg(&write.value);
            if let Some(ttl) = write.ttl {
                set.arg("PX").arg(ttl_ms(ttl));
            }
            set.ignore();

            for index in &write.indexes {
                pipe.cmd("ZADD")
                    .arg(&index.key)
                    .arg(index.score)
                    .arg(&index.member)
                    .ignore();
                if let Some(ttl) = index.ttl {
                    pipe.cmd("PEXPIRE").arg(&index.key).arg(ttl_ms(ttl)).ignore();
                }
            }

            pipe.query_async(&mut conn).await
        })
        .await
    }

    async fn delete_indexed(&self, key: &str, indexes: &[(String, String)]) -> StoreResult<()> {
        self.run("delete_indexed", |mut conn| async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("DEL").arg(key).ignore();
            for (index_key, member) in indexes {
                pipe.cmd("ZREM").arg(index_key).arg(member).ignore();
            }
            pipe.query_async(&mut conn).await
        })
        .await
    }

    async fn eval_sliding_window(
        &self,
        key: &str,
        now_micros: i64,
        window: Duration,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let cutoff = now_micros - window.as_micros() as i64;
        let (pruned_count,): (u64,) = self
            .run("sliding_window", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(cutoff)
                    .ignore()
                    .cmd("ZCARD")
                    .arg(key)
                    .cmd("ZADD")
                    .arg(key)
                    .arg(now_micros)
                    .arg(member)
                    .ignore()
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_ms(ttl))
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(pruned_count + 1)
    }

    async fn eval_token_bucket(
        &self,
        key: &str,
        params: &TokenBucketParams,
        now_ms: i64,
    ) -> StoreResult<TokenBucketOutcome> {
        let script = &self.token_bucket;
        let (allowed, tokens): (i64, i64) = self
            .run("token_bucket", |mut conn| async move {
                script
                    .key(key)
                    .arg(params.capacity.max(1))
                    .arg(params.refill_rate.max(1))
                    .arg((params.interval.as_millis() as u64).max(1))
                    .arg(now_ms)
                    .arg(ttl_ms(params.ttl))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(TokenBucketOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }
}
