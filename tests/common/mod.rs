//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use security_gateway::core::types::EventType;
use security_gateway::observability::{EventFilter, SecurityEvent};
use security_gateway::store::{
    IndexedWrite, KvStore, StoreError, StoreResult, TokenBucketOutcome, TokenBucketParams,
};
use security_gateway::{Gateway, GatewayConfig};

pub const CLIENT_IP: &str = "203.0.113.7";
pub const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
pub const TOKEN: &str = "Bearer 0123456789abcdef";

/// Defaults with a quiet monitor so only pipeline events are stored
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.monitoring.enable_threat_intelligence = false;
    config
}

/// A request from the fixed client with a browser user agent
pub fn client_request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", CLIENT_IP)
        .header("user-agent", BROWSER)
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible")
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_else(|| panic!("missing header {}", name))
}

/// Every stored event, newest first, after the writer has drained
pub async fn stored_events(gateway: &Gateway) -> Vec<SecurityEvent> {
    gateway.monitor().flush().await;
    gateway
        .state()
        .events()
        .query(&EventFilter {
            limit: Some(1_000),
            ..Default::default()
        })
        .await
        .expect("event query")
}

pub async fn events_of_type(gateway: &Gateway, event_type: EventType) -> Vec<SecurityEvent> {
    stored_events(gateway)
        .await
        .into_iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

/// Store whose every operation fails as if the server were down
pub struct UnreachableStore;

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl KvStore for UnreachableStore {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn ping(&self) -> StoreResult<()> {
        down()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        down()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        down()
    }

    async fn del(&self, _key: &str) -> StoreResult<bool> {
        down()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        down()
    }

    async fn zadd(&self, _key: &str, _member: &str, _score: f64) -> StoreResult<()> {
        down()
    }

    async fn zrange_by_score(&self, _key: &str, _min: f64, _max: f64) -> StoreResult<Vec<String>> {
        down()
    }

    async fn zrevrange(&self, _key: &str, _limit: Option<usize>) -> StoreResult<Vec<String>> {
        down()
    }

    async fn zrem(&self, _key: &str, _member: &str) -> StoreResult<()> {
        down()
    }

    async fn sadd(&self, _key: &str, _member: &str) -> StoreResult<()> {
        down()
    }

    async fn srem(&self, _key: &str, _member: &str) -> StoreResult<()> {
        down()
    }

    async fn smembers(&self, _key: &str) -> StoreResult<Vec<String>> {
        down()
    }

    async fn scan_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        down()
    }

    async fn write_indexed(&self, _write: &IndexedWrite) -> StoreResult<()> {
        down()
    }

    async fn delete_indexed(&self, _key: &str, _indexes: &[(String, String)]) -> StoreResult<()> {
        down()
    }

    async fn eval_sliding_window(
        &self,
        _key: &str,
        _now_micros: i64,
        _window: Duration,
        _member: &str,
        _ttl: Duration,
    ) -> StoreResult<u64> {
        down()
    }

    async fn eval_token_bucket(
        &self,
        _key: &str,
        _params: &TokenBucketParams,
        _now_ms: i64,
    ) -> StoreResult<TokenBucketOutcome> {
        down()
    }
}

pub fn unreachable_store() -> Arc<dyn KvStore> {
    Arc::new(UnreachableStore)
}
