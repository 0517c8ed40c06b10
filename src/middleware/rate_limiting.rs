//! # Rate Limiting System
//!
//! Request budgets per client IP, per user, per endpoint and globally, enforced
//! against the shared [`KvStore`] so every gateway instance sees the same counts.
//!
//! - Sliding window (default): one sorted set per key, pruned and counted in a
//!   single pipelined transaction
//! - Token bucket: one `{tokens, last_refill}` record per key, updated by a script
//!
//! ## Architecture
//! - `RateLimitAlgorithm`: one atomic store step per check
//! - `RateLimitKeyGenerator`: scope keys (`ip:<ip>`, `user:<uid>`, `endpoint:<method>:<url>`, `global`)
//! - `RateLimiter`: per-scope limit lookup, fail-open policy, metrics, cleanup task
//!
//! Store failures never deny a request while `fail_open` is set: the decision is
//! allowed, reports `remaining = 0` and carries the store error so the caller can
//! record a warning check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::{RateLimitAlgorithmKind, RateLimitingConfig, ScopeLimit};
use crate::core::context::{RequestScope, ScopeError};
use crate::core::types::{RateLimitInfo, SecurityRequest};
use crate::store::{KvStore, StoreError, TokenBucketParams};

/// Prefix of every rate-limit key in the store
pub const STORE_KEY_PREFIX: &str = "rate_limit";

/// Endpoint URLs longer than this are replaced by a fingerprint
const MAX_ENDPOINT_KEY_LEN: usize = 128;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error, Clone)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Rate limit check interrupted: {0}")]
    Interrupted(#[from] ScopeError),
    #[error("Rate limit task failed: {0}")]
    Task(String),
}

/// Outcome of one atomic algorithm step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlgorithmResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        store_key: &str,
        limit: &ScopeLimit,
        now: DateTime<Utc>,
    ) -> Result<AlgorithmResult, StoreError>;
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Sliding window algorithm implementation
pub struct SlidingWindowAlgorithm {
    store: Arc<dyn KvStore>,
    instance: String,
    sequence: AtomicU64,
}

impl SlidingWindowAlgorithm {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            instance: Uuid::new_v4().simple().to_string()[..8].to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Unique set member; the monotonic sequence keeps same-microsecond hits apart
    fn member(&self, now_micros: i64) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", now_micros, self.instance, seq)
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowAlgorithm {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn evaluate(
        &self,
        store_key: &str,
        limit: &ScopeLimit,
        now: DateTime<Utc>,
    ) -> Result<AlgorithmResult, StoreError> {
        let now_micros = now.timestamp_micros();
        let member = self.member(now_micros);

        let count = self
            .store
            .eval_sliding_window(store_key, now_micros, limit.window, &member, limit.window * 2)
            .await?;

        let count = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(AlgorithmResult {
            allowed: count <= limit.requests,
            remaining: limit.requests.saturating_sub(count),
            reset_at: now + chrono_duration(limit.window),
        })
    }
}

/// Token bucket algorithm implementation
pub struct TokenBucketAlgorithm {
    store: Arc<dyn KvStore>,
}

impl TokenBucketAlgorithm {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketAlgorithm {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn evaluate(
        &self,
        store_key: &str,
        limit: &ScopeLimit,
        now: DateTime<Utc>,
    ) -> Result<AlgorithmResult, StoreError> {
        let params = TokenBucketParams {
            capacity: limit.capacity(),
            refill_rate: limit.requests.max(1),
            interval: limit.window,
            ttl: limit.window * 2,
        };

        let outcome = self
            .store
            .eval_token_bucket(store_key, &params, now.timestamp_millis())
            .await?;

        // Denied callers can retry once the next whole token lands
        let reset_in = if outcome.allowed {
            limit.window
        } else {
            limit.window / params.refill_rate
        };

        Ok(AlgorithmResult {
            allowed: outcome.allowed,
            remaining: u32::try_from(outcome.tokens.max(0)).unwrap_or(0),
            reset_at: now + chrono_duration(reset_in),
        })
    }
}

/// Builds scope keys for a request
pub struct RateLimitKeyGenerator;

impl RateLimitKeyGenerator {
    pub fn ip(request: &SecurityRequest) -> String {
        format!("ip:{}", request.ip)
    }

    pub fn user(user_id: &str) -> String {
        format!("user:{}", user_id)
    }

    pub fn endpoint(request: &SecurityRequest) -> String {
        if request.url.len() > MAX_ENDPOINT_KEY_LEN {
            let digest = Sha256::digest(request.url.as_bytes());
            format!("endpoint:{}:{}", request.method, hex::encode(digest))
        } else {
            format!("endpoint:{}:{}", request.method, request.url)
        }
    }

    pub fn global() -> String {
        "global".to_string()
    }

    /// Ordered keys checked by [`RateLimiter::check_multi`]
    pub fn keys_for(request: &SecurityRequest) -> Vec<String> {
        let mut keys = Vec::with_capacity(4);
        keys.push(Self::ip(request));
        if let Some(user_id) = request.user_id.as_deref() {
            keys.push(Self::user(user_id));
        }
        keys.push(Self::endpoint(request));
        keys.push(Self::global());
        keys
    }

    /// Scope is the prefix before the first `:`
    pub fn scope_of(key: &str) -> &str {
        key.split(':').next().unwrap_or(key)
    }

    pub fn store_key(key: &str) -> String {
        format!("{}:{}", STORE_KEY_PREFIX, key)
    }
}

/// Decision for a single key
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub key: String,
    pub allowed: bool,
    pub info: RateLimitInfo,
    /// Store error absorbed by the fail-open policy
    pub degraded: Option<String>,
}

/// Decision across every scope that applies to a request
#[derive(Debug, Clone)]
pub struct MultiCheckResult {
    pub allowed: bool,
    /// Info of the denying key, else of the tightest allowed key
    pub info: RateLimitInfo,
    pub denied_key: Option<String>,
    pub keys_checked: usize,
    pub degraded: Option<String>,
}

#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
    pub store_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_denied: u64,
    pub store_errors: u64,
    pub tracked_keys: usize,
}

/// Main rate limiter implementation
pub struct RateLimiter {
    config: RateLimitingConfig,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    store: Arc<dyn KvStore>,
    metrics: RateLimitMetrics,
    /// Store key to (last write, ttl) for the cleanup task
    tracked: DashMap<String, (Instant, Duration)>,
}

impl RateLimiter {
    pub fn new(config: RateLimitingConfig, store: Arc<dyn KvStore>) -> Self {
        let algorithm: Arc<dyn RateLimitAlgorithm> = match config.algorithm {
            RateLimitAlgorithmKind::SlidingWindow => {
                Arc::new(SlidingWindowAlgorithm::new(Arc::clone(&store)))
            }
            RateLimitAlgorithmKind::TokenBucket => {
                Arc::new(TokenBucketAlgorithm::new(Arc::clone(&store)))
            }
        };

        info!(
            algorithm = algorithm.name(),
            store = store.name(),
            fail_open = config.fail_open,
            "Rate limiter initialized"
        );

        Self {
            config,
            algorithm,
            store,
            metrics: RateLimitMetrics::default(),
            tracked: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitingConfig {
        &self.config
    }

    /// Limit configured for the key's scope
    pub fn limit_for_key(&self, key: &str) -> ScopeLimit {
        self.config.limit_for(RateLimitKeyGenerator::scope_of(key))
    }

    /// Check one key against an explicit limit.
    ///
    /// The store step runs on its own task: if the deadline passes or the request
    /// is cancelled, the step still completes in the store and its result is dropped.
    pub async fn check(
        &self,
        key: &str,
        limit: &ScopeLimit,
        scope: &RequestScope,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now = Utc::now();
        let store_key = RateLimitKeyGenerator::store_key(key);

        let algorithm = Arc::clone(&self.algorithm);
        let task_key = store_key.clone();
        let task_limit = limit.clone();
        let step = tokio::spawn(async move { algorithm.evaluate(&task_key, &task_limit, now).await });

        let joined = scope.run(step).await?;
        let result = joined.map_err(|e| RateLimitError::Task(e.to_string()))?;

        match result {
            Ok(result) => {
                self.tracked
                    .insert(store_key, (Instant::now(), limit.window * 2));

                if result.allowed {
                    self.metrics.requests_allowed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.requests_denied.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, limit = limit.requests, "Rate limit exceeded");
                }

                Ok(RateLimitDecision {
                    key: key.to_string(),
                    allowed: result.allowed,
                    info: RateLimitInfo {
                        limit: limit.requests,
                        remaining: result.remaining,
                        reset_at: result.reset_at,
                        window: limit.window,
                        blocked: !result.allowed,
                    },
                    degraded: None,
                })
            }
            Err(e) => {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                if !self.config.fail_open {
                    error!(key = %key, error = %e, "Rate limit store unavailable, failing closed");
                    return Err(e.into());
                }

                error!(key = %key, error = %e, "Rate limit store unavailable, failing open");
                Ok(RateLimitDecision {
                    key: key.to_string(),
                    allowed: true,
                    info: RateLimitInfo {
                        limit: limit.requests,
                        remaining: 0,
                        reset_at: now + chrono_duration(limit.window),
                        window: limit.window,
                        blocked: false,
                    },
                    degraded: Some(e.to_string()),
                })
            }
        }
    }

    /// Check a key using the limit configured for its scope
    pub async fn check_key(
        &self,
        key: &str,
        scope: &RequestScope,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let limit = self.limit_for_key(key);
        self.check(key, &limit, scope).await
    }

    /// Ordered checks over every scope that applies; first denial wins
    pub async fn check_multi(
        &self,
        request: &SecurityRequest,
        scope: &RequestScope,
    ) -> Result<MultiCheckResult, RateLimitError> {
        let keys = RateLimitKeyGenerator::keys_for(request);
        self.check_keys(&keys, scope).await
    }

    /// Budget for an authenticated user, checked once identity is known
    pub async fn check_user(
        &self,
        user_id: &str,
        scope: &RequestScope,
    ) -> Result<MultiCheckResult, RateLimitError> {
        self.check_keys(&[RateLimitKeyGenerator::user(user_id)], scope)
            .await
    }

    async fn check_keys(
        &self,
        keys: &[String],
        scope: &RequestScope,
    ) -> Result<MultiCheckResult, RateLimitError> {
        if !self.config.enabled {
            let limit = self.config.limit_for("ip");
            return Ok(MultiCheckResult {
                allowed: true,
                info: RateLimitInfo::unlimited(limit.requests, limit.window),
                denied_key: None,
                keys_checked: 0,
                degraded: None,
            });
        }

        let mut tightest: Option<RateLimitInfo> = None;
        let mut degraded: Option<String> = None;

        for (checked, key) in keys.iter().enumerate() {
            let decision = self.check_key(key, scope).await?;
            if degraded.is_none() {
                degraded = decision.degraded.clone();
            }

            if !decision.allowed {
                return Ok(MultiCheckResult {
                    allowed: false,
                    info: decision.info,
                    denied_key: Some(decision.key),
                    keys_checked: checked + 1,
                    degraded,
                });
            }

            let tighter = tightest
                .as_ref()
                .map_or(true, |current| decision.info.remaining < current.remaining);
            if tighter {
                tightest = Some(decision.info);
            }
        }

        let info = match tightest {
            Some(info) => info,
            None => {
                let limit = self.config.limit_for("global");
                RateLimitInfo::unlimited(limit.requests, limit.window)
            }
        };

        Ok(MultiCheckResult {
            allowed: true,
            info,
            denied_key: None,
            keys_checked: keys.len(),
            degraded,
        })
    }

    /// Re-extend expirations of keys written within their TTL; forget the rest
    pub async fn refresh_tracked_keys(&self) -> usize {
        let snapshot: Vec<(String, Instant, Duration)> = self
            .tracked
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().0, entry.value().1))
            .collect();

        let mut refreshed = 0;
        for (key, last_write, ttl) in snapshot {
            if last_write.elapsed() >= ttl {
                self.tracked.remove(&key);
                continue;
            }
            match self.store.expire(&key, ttl).await {
                Ok(true) => refreshed += 1,
                Ok(false) => {
                    self.tracked.remove(&key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to refresh rate limit key expiry");
                }
            }
        }
        refreshed
    }

    /// Spawn the periodic cleanup task; stops when `shutdown` is cancelled
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Rate limit cleanup task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let refreshed = limiter.refresh_tracked_keys().await;
                        let swept = match limiter.store.sweep_expired().await {
                            Ok(swept) => swept,
                            Err(e) => {
                                warn!(error = %e, "Failed to sweep expired store keys");
                                0
                            }
                        };
                        debug!(refreshed, swept, tracked = limiter.tracked.len(), "Rate limit cleanup pass");
                    }
                }
            }
        })
    }

    pub fn get_metrics(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            requests_allowed: self.metrics.requests_allowed.load(Ordering::Relaxed),
            requests_denied: self.metrics.requests_denied.load(Ordering::Relaxed),
            store_errors: self.metrics.store_errors.load(Ordering::Relaxed),
            tracked_keys: self.tracked.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        IndexedWrite, MemoryStore, StoreResult, TokenBucketOutcome,
    };
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;

    /// Store whose every operation fails, as during an outage
    struct UnreachableStore;

    #[async_trait]
    impl KvStore for UnreachableStore {
        fn name(&self) -> &'static str {
            "unreachable"
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn del(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zadd(&self, _: &str, _: &str, _: f64) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zrange_by_score(&self, _: &str, _: f64, _: f64) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zrevrange(&self, _: &str, _: Option<usize>) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn zrem(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn sadd(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn srem(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn smembers(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn scan_prefix(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn write_indexed(&self, _: &IndexedWrite) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete_indexed(&self, _: &str, _: &[(String, String)]) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn eval_sliding_window(
            &self,
            _: &str,
            _: i64,
            _: Duration,
            _: &str,
            _: Duration,
        ) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn eval_token_bucket(
            &self,
            _: &str,
            _: &TokenBucketParams,
            _: i64,
        ) -> StoreResult<TokenBucketOutcome> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn config(algorithm: RateLimitAlgorithmKind, ip_limit: u32) -> RateLimitingConfig {
        let mut config = RateLimitingConfig {
            algorithm,
            ..Default::default()
        };
        config
            .limits
            .insert("ip".to_string(), ScopeLimit::new(ip_limit, Duration::from_secs(60)));
        config
    }

    fn request(ip: &str, url: &str) -> SecurityRequest {
        SecurityRequest::from_transport(
            Method::GET,
            url,
            &HeaderMap::new(),
            Bytes::new(),
            &format!("{}:40000", ip),
            1024,
        )
    }

    fn scope() -> RequestScope {
        RequestScope::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_sliding_window_remaining_counts_down() {
        let limiter = RateLimiter::new(
            config(RateLimitAlgorithmKind::SlidingWindow, 3),
            Arc::new(MemoryStore::new()),
        );
        let req = request("203.0.113.7", "/api/v1/orders");

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let result = limiter.check_multi(&req, &scope()).await.unwrap();
            assert!(result.allowed);
            remaining.push(result.info.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check_multi(&req, &scope()).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.denied_key.as_deref(), Some("ip:203.0.113.7"));
        assert_eq!(denied.info.remaining, 0);
        assert!(denied.info.blocked);
        assert!(denied.info.reset_at > Utc::now());
        // denial stops before the endpoint and global checks
        assert_eq!(denied.keys_checked, 1);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let limiter = RateLimiter::new(
            config(RateLimitAlgorithmKind::SlidingWindow, 1),
            Arc::new(MemoryStore::new()),
        );
        assert!(limiter
            .check_multi(&request("198.51.100.1", "/a"), &scope())
            .await
            .unwrap()
            .allowed);
        assert!(limiter
            .check_multi(&request("198.51.100.2", "/a"), &scope())
            .await
            .unwrap()
            .allowed);
        assert!(!limiter
            .check_multi(&request("198.51.100.1", "/b"), &scope())
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_never_goes_negative() {
        let mut cfg = config(RateLimitAlgorithmKind::TokenBucket, 2);
        cfg.limits.get_mut("ip").unwrap().burst = Some(2);
        let limiter = RateLimiter::new(cfg, Arc::new(MemoryStore::new()));
        let limit = limiter.limit_for_key("ip:192.0.2.1");

        let mut allowed = 0;
        for _ in 0..5 {
            let decision = limiter.check("ip:192.0.2.1", &limit, &scope()).await.unwrap();
            if decision.allowed {
                allowed += 1;
            }
            assert!(decision.info.remaining <= 2);
        }
        assert_eq!(allowed, 2);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_with_zero_remaining() {
        let limiter = RateLimiter::new(
            config(RateLimitAlgorithmKind::SlidingWindow, 3),
            Arc::new(UnreachableStore),
        );
        let result = limiter
            .check_multi(&request("203.0.113.9", "/health"), &scope())
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.info.remaining, 0);
        assert!(result.degraded.is_some());
        assert_eq!(limiter.get_metrics().store_errors, 3);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_when_configured() {
        let mut cfg = config(RateLimitAlgorithmKind::SlidingWindow, 3);
        cfg.fail_open = false;
        let limiter = RateLimiter::new(cfg, Arc::new(UnreachableStore));
        let result = limiter
            .check_multi(&request("203.0.113.9", "/health"), &scope())
            .await;
        assert!(matches!(result, Err(RateLimitError::Storage(_))));
    }

    #[tokio::test]
    async fn test_user_key_included_when_present() {
        let mut req = request("192.0.2.5", "/orders");
        assert_eq!(RateLimitKeyGenerator::keys_for(&req).len(), 3);
        req.user_id = Some("u-1".to_string());
        let keys = RateLimitKeyGenerator::keys_for(&req);
        assert_eq!(keys[1], "user:u-1");
        assert_eq!(keys[2], "endpoint:GET:/orders");
        assert_eq!(keys[3], "global");
        assert_eq!(RateLimitKeyGenerator::scope_of(&keys[2]), "endpoint");
    }

    #[test]
    fn test_long_endpoint_is_fingerprinted() {
        let url = format!("/search?q={}", "x".repeat(300));
        let key = RateLimitKeyGenerator::endpoint(&request("192.0.2.5", &url));
        assert!(key.starts_with("endpoint:GET:"));
        assert!(key.len() < 100);
    }

    #[tokio::test]
    async fn test_cleanup_refreshes_live_keys() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            config(RateLimitAlgorithmKind::SlidingWindow, 10),
            store.clone(),
        );
        limiter
            .check_key("ip:192.0.2.10", &scope())
            .await
            .unwrap();
        assert_eq!(limiter.refresh_tracked_keys().await, 1);
        assert!(store.ttl("rate_limit:ip:192.0.2.10").is_some());
    }

    #[tokio::test]
    async fn test_cleanup_task_sweeps_expired_keys() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            store
                .set(&format!("security:events:e{}", i), "{}", Some(Duration::from_millis(1)))
                .await
                .unwrap();
        }
        let mut cfg = config(RateLimitAlgorithmKind::SlidingWindow, 10);
        cfg.cleanup_interval = Duration::from_millis(20);
        let limiter = Arc::new(RateLimiter::new(cfg, store.clone()));
        let shutdown = CancellationToken::new();
        let task = limiter.spawn_cleanup(shutdown.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while store.len() > 0 {
            assert!(Instant::now() < deadline, "expired keys never swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let mut cfg = config(RateLimitAlgorithmKind::SlidingWindow, 1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(cfg, Arc::new(UnreachableStore));
        let req = request("192.0.2.20", "/x");
        for _ in 0..3 {
            let result = limiter.check_multi(&req, &scope()).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.keys_checked, 0);
        }
    }
}
