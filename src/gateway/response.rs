//! Denial bodies and the headers every reply carries.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use serde_json::{json, Value};

use crate::core::types::{
    BlockReason, DenialKind, RateLimitInfo, SecurityRequest, CORRELATION_ID_HEADER,
    REQUEST_ID_HEADER,
};

/// Value of `X-Security-Gateway`
pub const GATEWAY_HEADER_VALUE: &str = "go-coffee-security-gateway";

pub const SECURITY_GATEWAY_HEADER: &str = "x-security-gateway";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
pub const WAF_SCORE_HEADER: &str = "x-waf-score";
pub const CHALLENGE_HEADER: &str = "x-security-challenge";

/// Build a JSON response without going through a fallible builder
pub fn create_json_response(status: StatusCode, body: Value) -> Response {
    let body_bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    let mut response = Response::new(Body::from(body_bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// JSON body of a denial: `{error, message, request_id[, rule|service|retry_after]}`
pub fn denial_body(request_id: &str, reason: &BlockReason) -> Value {
    let mut body = json!({
        "error": reason.kind.error_label(),
        "message": reason.message,
        "request_id": request_id,
    });

    if let Some(fields) = body.as_object_mut() {
        if let Some(rule) = &reason.rule {
            fields.insert("rule".into(), json!(rule));
        }
        if let Some(service) = &reason.service {
            fields.insert("service".into(), json!(service));
        }
        if let Some(retry_after) = reason.retry_after {
            fields.insert("retry_after".into(), json!(retry_after.to_string()));
        }
    }

    body
}

/// Response for a blocking or challenging verdict
pub fn denial_response(request_id: &str, reason: &BlockReason) -> Response {
    let mut response = create_json_response(reason.kind.status_code(), denial_body(request_id, reason));

    let headers = response.headers_mut();
    if let Some(retry_after) = reason.retry_after {
        insert(headers, axum::http::header::RETRY_AFTER, &retry_after.to_string());
    }
    if reason.kind == DenialKind::Challenge {
        headers.insert(
            HeaderName::from_static(CHALLENGE_HEADER),
            HeaderValue::from_static("required"),
        );
    }

    response
}

/// Stamp the identification, rate-limit and WAF headers onto a reply
pub fn apply_security_headers(
    response: &mut Response,
    request: &SecurityRequest,
    rate_limit: &RateLimitInfo,
    waf_score: u32,
) {
    let headers = response.headers_mut();

    insert(headers, HeaderName::from_static(REQUEST_ID_HEADER), &request.id);
    insert(
        headers,
        HeaderName::from_static(CORRELATION_ID_HEADER),
        &request.correlation_id,
    );
    headers.insert(
        HeaderName::from_static(SECURITY_GATEWAY_HEADER),
        HeaderValue::from_static(GATEWAY_HEADER_VALUE),
    );
    insert(
        headers,
        HeaderName::from_static(RATE_LIMIT_LIMIT_HEADER),
        &rate_limit.limit.to_string(),
    );
    insert(
        headers,
        HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
        &rate_limit.remaining.to_string(),
    );
    insert(
        headers,
        HeaderName::from_static(RATE_LIMIT_RESET_HEADER),
        &rate_limit.reset_unix().to_string(),
    );
    insert(headers, HeaderName::from_static(WAF_SCORE_HEADER), &waf_score.to_string());
}

/// Ids come from sanitized caller input or uuids; anything else is skipped
fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use bytes::Bytes;
    use std::time::Duration;

    fn request() -> SecurityRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", HeaderValue::from_static("corr-1"));
        SecurityRequest::from_transport(
            Method::GET,
            "/api/v1/orders",
            &headers,
            Bytes::new(),
            "203.0.113.7:4000",
            1024,
        )
    }

    #[test]
    fn test_rate_limit_denial_body() {
        let reason = BlockReason::new(DenialKind::RateLimited, "Rate limit exceeded").with_retry_after(60);
        let body = denial_body("req-1", &reason);

        assert_eq!(body["error"], "Too Many Requests");
        assert_eq!(body["message"], "Rate limit exceeded");
        assert_eq!(body["request_id"], "req-1");
        assert_eq!(body["retry_after"], "60");
        assert!(body.get("rule").is_none());
    }

    #[test]
    fn test_challenge_response_carries_header() {
        let reason = BlockReason::new(DenialKind::Challenge, "WAF rule violation: scanner")
            .with_rule("custom_001");
        let response = denial_response("req-2", &reason);

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CHALLENGE_HEADER], "required");
    }

    #[test]
    fn test_security_headers_present() {
        let request = request();
        let info = RateLimitInfo::unlimited(100, Duration::from_secs(60));
        let mut response = create_json_response(StatusCode::OK, json!({}));
        apply_security_headers(&mut response, &request, &info, 15);

        let headers = response.headers();
        assert_eq!(headers[REQUEST_ID_HEADER], request.id.as_str());
        assert_eq!(headers[CORRELATION_ID_HEADER], "corr-1");
        assert_eq!(headers[SECURITY_GATEWAY_HEADER], GATEWAY_HEADER_VALUE);
        assert_eq!(headers[RATE_LIMIT_LIMIT_HEADER], "100");
        assert_eq!(headers[RATE_LIMIT_REMAINING_HEADER], "100");
        assert_eq!(headers[WAF_SCORE_HEADER], "15");
        assert_eq!(
            headers[RATE_LIMIT_RESET_HEADER],
            info.reset_unix().to_string().as_str()
        );
    }
}
