//! # Shared Key-Value Store
//!
//! Capability interface over the store shared between gateway instances. It holds
//! rate-limit buckets, security events with their indexes, and alerts.
//!
//! Two backends implement [`KvStore`]:
//! - [`RedisStore`] for multi-instance deployments
//! - [`MemoryStore`] for single-node deployments and tests
//!
//! Both provide the same atomicity: the sliding-window step and indexed writes run
//! as one pipelined transaction, the token-bucket step as one scripted evaluation.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Store error types
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("wrong value type at key '{0}'")]
    WrongType(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Redis(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Sorted-set membership written together with a value
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: String,
    pub member: String,
    pub score: f64,
    pub ttl: Option<Duration>,
}

/// A value plus its index memberships, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedWrite {
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
    pub indexes: Vec<IndexEntry>,
}

/// Parameters of one token-bucket step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketParams {
    pub capacity: u32,
    /// Tokens added per `interval`
    pub refill_rate: u32,
    pub interval: Duration,
    pub ttl: Duration,
}

/// Bucket state persisted under a token-bucket key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: i64,
    /// Unix milliseconds of the last refill
    pub last_refill: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketOutcome {
    pub allowed: bool,
    /// Tokens left after this step
    pub tokens: i64,
}

/// One token-bucket step; the Redis script mirrors this exactly.
///
/// Whole tokens are added for elapsed time, clamped to capacity. When the
/// bucket fills, `last_refill` jumps to `now`; otherwise it advances by the time
/// the added tokens account for so partial progress is kept.
pub fn token_bucket_step(
    state: Option<BucketState>,
    params: &TokenBucketParams,
    now_ms: i64,
) -> (BucketState, TokenBucketOutcome) {
    let capacity = params.capacity.max(1) as i64;
    let refill_rate = params.refill_rate.max(1) as i64;
    let interval_ms = (params.interval.as_millis() as i64).max(1);

    let BucketState {
        mut tokens,
        mut last_refill,
    } = state.unwrap_or(BucketState {
        tokens: capacity,
        last_refill: now_ms,
    });

    let elapsed = (now_ms - last_refill).max(0);
    let added = elapsed * refill_rate / interval_ms;
    if added > 0 {
        tokens = (tokens + added).min(capacity);
        if tokens >= capacity {
            last_refill = now_ms;
        } else {
            last_refill += added * interval_ms / refill_rate;
        }
    }

    let allowed = tokens >= 1;
    if allowed {
        tokens -= 1;
    }

    (
        BucketState {
            tokens,
            last_refill,
        },
        TokenBucketOutcome { allowed, tokens },
    )
}

/// Capability interface over the shared key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logs and health output
    fn name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns whether the key existed
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Returns whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    /// Highest-scored members first; `None` returns all
    async fn zrevrange(&self, key: &str, limit: Option<usize>) -> StoreResult<Vec<String>>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Every live key starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Write a value and all of its index memberships in one atomic step
    async fn write_indexed(&self, write: &IndexedWrite) -> StoreResult<()>;

    /// Delete a value and remove it from the given `(index key, member)` pairs atomically
    async fn delete_indexed(&self, key: &str, indexes: &[(String, String)]) -> StoreResult<()>;

    /// Sliding-window step: prune `score <= now - window`, count, insert `member`
    /// at `now`, refresh expiry. Returns the cardinality after insertion.
    async fn eval_sliding_window(
        &self,
        key: &str,
        now_micros: i64,
        window: Duration,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<u64>;

    /// Token-bucket step per [`token_bucket_step`]
    async fn eval_token_bucket(
        &self,
        key: &str,
        params: &TokenBucketParams,
        now_ms: i64,
    ) -> StoreResult<TokenBucketOutcome>;

    /// Drop keys whose TTL has passed. Backends that expire keys themselves return 0.
    async fn sweep_expired(&self) -> StoreResult<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(capacity: u32, refill_rate: u32, interval_secs: u64) -> TokenBucketParams {
        TokenBucketParams {
            capacity,
            refill_rate,
            interval: Duration::from_secs(interval_secs),
            ttl: Duration::from_secs(interval_secs * 2),
        }
    }

    #[test]
    fn test_bucket_starts_full_and_drains() {
        let p = params(2, 2, 60);
        let (state, first) = token_bucket_step(None, &p, 1_000);
        assert!(first.allowed);
        assert_eq!(first.tokens, 1);

        let (state, second) = token_bucket_step(Some(state), &p, 1_001);
        assert!(second.allowed);
        assert_eq!(second.tokens, 0);

        let (_, third) = token_bucket_step(Some(state), &p, 1_002);
        assert!(!third.allowed);
        assert_eq!(third.tokens, 0);
    }

    #[test]
    fn test_bucket_refills_whole_tokens_only() {
        let p = params(10, 60, 60);
        let empty = BucketState {
            tokens: 0,
            last_refill: 0,
        };

        // 60 tokens per minute is one per second
        let (_, early) = token_bucket_step(Some(empty), &p, 999);
        assert!(!early.allowed);

        let (state, on_time) = token_bucket_step(Some(empty), &p, 2_500);
        assert!(on_time.allowed);
        assert_eq!(on_time.tokens, 1);
        // half a second of progress is kept
        assert_eq!(state.last_refill, 2_000);
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let p = params(5, 100, 1);
        let stale = BucketState {
            tokens: 3,
            last_refill: 0,
        };
        let (state, outcome) = token_bucket_step(Some(stale), &p, 3_600_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 4);
        assert_eq!(state.last_refill, 3_600_000);
    }
}
