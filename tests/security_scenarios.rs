//! End-to-end behavior of the security pipeline through the full router.

mod common;

use axum::body::Body;
use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header as header_matcher, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use security_gateway::core::config::ScopeLimit;
use security_gateway::core::types::{EventType, Severity};
use security_gateway::observability::{KvAlertManager, KvEventStore, SecurityMetrics};
use security_gateway::store::MemoryStore;
use security_gateway::Gateway;

async fn upstream_ok() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_ip_rate_limit_blocks_fourth_request() {
    let upstream = upstream_ok().await;
    let mut config = test_config();
    config.auth.enabled = false;
    config.services.insert("api".to_string(), upstream.uri());
    config
        .rate_limit
        .limits
        .insert("ip".to_string(), ScopeLimit::new(3, Duration::from_secs(60)));

    let gateway = Gateway::builder(config).build().unwrap();
    let router = gateway.router();

    for expected in ["2", "1", "0"] {
        let response = send(
            &router,
            client_request("GET", "/api/v1/orders").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-remaining"), expected);
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
    }

    let response = send(
        &router,
        client_request("GET", "/api/v1/orders").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert_eq!(header(&response, "retry-after"), "60");
    let request_id = header(&response, "x-request-id").to_string();

    let body = json_body(response).await;
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["message"], "Rate limit exceeded");
    assert_eq!(body["retry_after"], "60");
    assert_eq!(body["request_id"], request_id.as_str());

    let blocked = events_of_type(&gateway, EventType::MaliciousActivity).await;
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].severity, Severity::Medium);
    assert_eq!(blocked[0].request_id(), Some(request_id.as_str()));
    assert_eq!(blocked[0].ip_address.as_deref(), Some(CLIENT_IP));

    let allowed = events_of_type(&gateway, EventType::NetworkActivity).await;
    assert_eq!(allowed.len(), 3);
}

#[tokio::test]
async fn test_sql_injection_blocked_by_waf() {
    let gateway = Gateway::builder(test_config()).build().unwrap();
    let router = gateway.router();

    let response = send(
        &router,
        client_request("GET", "/api/v1/users?id=1%20UNION%20SELECT%201")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let score: u32 = header(&response, "x-waf-score").parse().unwrap();
    assert!(score >= 80, "waf score {}", score);
    assert_eq!(header(&response, "x-security-gateway"), "go-coffee-security-gateway");

    let body = json_body(response).await;
    assert_eq!(body["rule"], "sql_001");

    let events = stored_events(&gateway).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::High);
    assert_eq!(events[0].metadata["rule"], "sql_001");
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let mut config = test_config();
    config.server.max_request_size = 64;
    let gateway = Gateway::builder(config).build().unwrap();
    let router = gateway.router();

    let response = send(
        &router,
        client_request("POST", "/ingest")
            .header("authorization", TOKEN)
            .body(Body::from(vec![b'a'; 65]))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let request_id = header(&response, "x-request-id").to_string();
    let body = json_body(response).await;
    assert_eq!(body["error"], "Payload Too Large");
    assert_eq!(body["request_id"], request_id.as_str());

    let events = stored_events(&gateway).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::MaliciousActivity);
    assert_eq!(events[0].severity, Severity::Medium);
    assert_eq!(events[0].metadata["reason"], "request size exceeded");
}

#[tokio::test]
async fn test_body_at_limit_is_not_rejected_for_size() {
    let mut config = test_config();
    config.server.max_request_size = 64;
    let gateway = Gateway::builder(config).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("POST", "/ingest")
            .header("authorization", TOKEN)
            .body(Body::from(vec![b'a'; 64]))
            .unwrap(),
    )
    .await;

    // no `ingest` service is configured, so an admitted request ends at the proxy
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_authorized_request_proxied_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/42"))
        .and(query_param("customer_id", "c1"))
        .and(header_matcher("x-request-id", "req-42"))
        .and(header_matcher("x-gateway", "security-gateway"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut config = test_config();
    config.services.insert("orders".to_string(), upstream.uri());
    let gateway = Gateway::builder(config).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/orders/v1/orders/42?customer_id=c1")
            .header("authorization", TOKEN)
            .header("x-request-id", "req-42")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-request-id"), "req-42");
    assert_eq!(header(&response, "x-correlation-id"), "req-42");
    assert_eq!(header(&response, "x-security-gateway"), "go-coffee-security-gateway");
    assert_eq!(header(&response, "x-waf-score"), "0");
    assert_eq!(json_body(response).await["id"], "42");

    let events = stored_events(&gateway).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::NetworkActivity);
    assert_eq!(events[0].severity, Severity::Info);
    assert_eq!(events[0].metadata["status_code"], 200);
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let gateway = Gateway::builder(test_config()).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/orders/v1/orders").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let events = events_of_type(&gateway, EventType::Authentication).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].severity >= Severity::Medium);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let mut config = test_config();
    config.auth.enabled = false;
    // nothing listens on the discard port
    config
        .services
        .insert("orders".to_string(), "http://127.0.0.1:9".to_string());
    let gateway = Gateway::builder(config).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/orders/v1/orders").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["service"], "orders");

    let events = events_of_type(&gateway, EventType::SystemAccess).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["service"], "orders");
}

#[tokio::test]
async fn test_validate_rejects_malformed_email() {
    let gateway = Gateway::builder(test_config()).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("POST", "/api/v1/security/validate")
            .header("content-type", "application/json")
            .body(Body::from(json!({"type": "email", "value": "a@b"}).to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["valid"], false);
    assert_eq!(body["errors"], json!(["invalid email format"]));
    assert_eq!(body["threat_level"], "none");
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let events_store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(SecurityMetrics::new());
    let gateway = Gateway::builder(test_config())
        .store(unreachable_store())
        .event_store(Arc::new(KvEventStore::new(
            events_store.clone(),
            Duration::from_secs(3600),
        )))
        .alert_sink(Arc::new(KvAlertManager::new(events_store, metrics)))
        .build()
        .unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert_eq!(json_body(response).await["status"], "healthy");

    let degraded = events_of_type(&gateway, EventType::SystemAccess).await;
    assert_eq!(degraded.len(), 1);
    assert_eq!(degraded[0].severity, Severity::High);
    assert!(degraded[0].description.contains("rate limiter degraded"));
}

#[tokio::test]
async fn test_store_outage_with_waf_block_stores_one_event() {
    let events_store = Arc::new(MemoryStore::new());
    let gateway = Gateway::builder(test_config())
        .store(unreachable_store())
        .event_store(Arc::new(KvEventStore::new(
            events_store.clone(),
            Duration::from_secs(3600),
        )))
        .alert_sink(Arc::new(KvAlertManager::new(
            events_store,
            Arc::new(SecurityMetrics::new()),
        )))
        .build()
        .unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/api/v1/users?id=1%20UNION%20SELECT%201")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = stored_events(&gateway).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::MaliciousActivity);
    assert_eq!(events[0].severity, Severity::High);
    assert!(events[0].metadata.contains_key("rate_limit_degraded"));
}

#[tokio::test]
async fn test_store_outage_fails_closed_when_configured() {
    let events_store = Arc::new(MemoryStore::new());
    let mut config = test_config();
    config.rate_limit.fail_open = false;
    let gateway = Gateway::builder(config)
        .store(unreachable_store())
        .event_store(Arc::new(KvEventStore::new(
            events_store.clone(),
            Duration::from_secs(3600),
        )))
        .alert_sink(Arc::new(KvAlertManager::new(
            events_store,
            Arc::new(SecurityMetrics::new()),
        )))
        .build()
        .unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let events = events_of_type(&gateway, EventType::SystemAccess).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::High);
}

#[tokio::test]
async fn test_every_reply_carries_identification_headers() {
    let gateway = Gateway::builder(test_config()).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/health")
            .header("x-correlation-id", "flow-7")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    for name in [
        "x-request-id",
        "x-correlation-id",
        "x-security-gateway",
        "x-ratelimit-limit",
        "x-ratelimit-remaining",
        "x-ratelimit-reset",
        "x-waf-score",
    ] {
        assert!(response.headers().contains_key(name), "missing {}", name);
    }
    assert_eq!(header(&response, "x-correlation-id"), "flow-7");
    let reset: i64 = header(&response, "x-ratelimit-reset").parse().unwrap();
    assert!(reset > chrono::Utc::now().timestamp() - 1);
}

#[tokio::test]
async fn test_supplied_correlation_id_returned_unchanged() {
    let gateway = Gateway::builder(test_config()).build().unwrap();
    let router = gateway.router();
    let long_id = "c".repeat(200);

    for supplied in ["trace 42", long_id.as_str()] {
        let response = send(
            &router,
            client_request("GET", "/health")
                .header("x-correlation-id", supplied)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(header(&response, "x-correlation-id"), supplied);
    }
}

#[tokio::test]
async fn test_blacklisted_ip_denied() {
    let mut config = test_config();
    config.waf.ip_blacklist = vec!["203.0.113.0/24".to_string()];
    let gateway = Gateway::builder(config).build().unwrap();

    let response = send(
        &gateway.router(),
        client_request("GET", "/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "Forbidden");
}
