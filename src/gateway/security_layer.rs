//! # Security Middleware
//!
//! Wraps every route. For each request it:
//! - takes a concurrency permit (503 when none is free)
//! - reads the body up to `max_request_size + 1` bytes under the request deadline
//! - builds the envelope and runs the current [`SecurityPipeline`]
//! - on denial, stores one block event and answers with the JSON denial
//! - on allow, calls the route and stores one "request allowed" event
//! - stamps the identification and rate-limit headers onto the reply
//!
//! A request dropped by the client before completion cancels its scope and
//! stores a `network-activity` event with status `cancelled`.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::core::context::RequestScope;
use crate::core::types::{
    BlockReason, DenialKind, EventType, SecurityRequest, Severity, CORRELATION_ID_HEADER,
    REQUEST_ID_HEADER,
};
use crate::gateway::pipeline::{interrupted, PipelineOutcome, SecurityPipeline};
use crate::gateway::response::{apply_security_headers, denial_response};
use crate::gateway::server::AppState;
use crate::observability::events::GATEWAY_SOURCE;
use crate::observability::{SecurityEvent, SecurityMonitor};

/// Per-request facts handed to route handlers through request extensions
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub correlation_id: String,
    pub client_ip: String,
    pub identity: Option<Identity>,
    pub scope: RequestScope,
    /// Pipeline generation that admitted the request
    pub pipeline: Arc<SecurityPipeline>,
}

/// Set on a response when the upstream could not be reached
#[derive(Debug, Clone)]
pub struct UpstreamFailure(pub BlockReason);

pub async fn security_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let pipeline = state.pipeline();
    let max_request_size = pipeline.config().server.max_request_size;
    let timeout = pipeline.config().server.timeout;

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let Ok(_permit) = Arc::clone(state.concurrency()).try_acquire_owned() else {
        return overloaded(&state, &pipeline, request, &remote, started);
    };

    let scope = RequestScope::new(timeout);
    let mut guard = CancelGuard::new(state.monitor().clone(), scope.clone());

    let (mut parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let (body, read_failure) = match read_body(body, max_request_size, &scope).await {
        Ok(body) => (body, None),
        Err(reason) => (Bytes::new(), Some(reason)),
    };

    let mut envelope = SecurityRequest::from_transport(
        parts.method.clone(),
        &url,
        &parts.headers,
        body,
        &remote,
        max_request_size,
    );
    guard.track(&envelope);

    let outcome = match read_failure {
        Some(reason) => pipeline.short_circuit(&mut envelope, reason),
        None => pipeline.evaluate(&mut envelope, &scope).await,
    };

    let mut response = match outcome.verdict.reason() {
        Some(reason) => {
            debug!(
                request_id = %envelope.id,
                client_ip = %envelope.ip,
                kind = ?reason.kind,
                reason = %reason.message,
                "Request denied"
            );
            state.metrics().record_blocked_request();
            state
                .monitor()
                .log_event(pipeline.block_event(&envelope, reason, &outcome));
            denial_response(&envelope.id, reason)
        }
        None => {
            set_header(&mut parts.headers, REQUEST_ID_HEADER, &envelope.id);
            set_header(&mut parts.headers, CORRELATION_ID_HEADER, &envelope.correlation_id);
            parts.extensions.insert(RequestContext {
                request_id: envelope.id.clone(),
                correlation_id: envelope.correlation_id.clone(),
                client_ip: envelope.ip.to_string(),
                identity: outcome.identity.clone(),
                scope: scope.clone(),
                pipeline: Arc::clone(&pipeline),
            });

            let request = Request::from_parts(parts, Body::from(envelope.body.clone()));
            let response = next.run(request).await;
            record_completion(state.monitor(), &pipeline, &envelope, &outcome, &response, started);
            response
        }
    };

    apply_security_headers(&mut response, &envelope, &outcome.rate_limit, outcome.waf_score);
    state.metrics().record_request(started.elapsed());
    guard.disarm();
    response
}

fn record_completion(
    monitor: &SecurityMonitor,
    pipeline: &SecurityPipeline,
    envelope: &SecurityRequest,
    outcome: &PipelineOutcome,
    response: &Response,
    started: Instant,
) {
    if let Some(UpstreamFailure(reason)) = response.extensions().get::<UpstreamFailure>() {
        monitor.log_event(pipeline.block_event(envelope, reason, outcome));
        return;
    }
    if let Some(event) = pipeline.degraded_event(envelope, outcome) {
        monitor.log_event(event);
    }

    monitor.log_event(
        SecurityEvent::new(
            EventType::NetworkActivity,
            Severity::Info,
            GATEWAY_SOURCE,
            "request allowed",
        )
        .with_request(envelope)
        .with_metadata("status_code", response.status().as_u16())
        .with_metadata("duration_ms", started.elapsed().as_millis() as u64)
        .with_metadata("waf_score", outcome.waf_score),
    );
}

/// Reply when every concurrency permit is taken
fn overloaded(
    state: &AppState,
    pipeline: &SecurityPipeline,
    request: Request,
    remote: &str,
    started: Instant,
) -> Response {
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let mut envelope = SecurityRequest::from_transport(
        request.method().clone(),
        &url,
        request.headers(),
        Bytes::new(),
        remote,
        pipeline.config().server.max_request_size,
    );

    warn!(request_id = %envelope.id, client_ip = %envelope.ip, "Gateway at capacity, rejecting request");
    let reason = BlockReason::new(DenialKind::Overloaded, "gateway at capacity");
    let outcome = pipeline.short_circuit(&mut envelope, reason.clone());

    state.metrics().record_blocked_request();
    state
        .monitor()
        .log_event(pipeline.block_event(&envelope, &reason, &outcome));

    let mut response = denial_response(&envelope.id, &reason);
    apply_security_headers(&mut response, &envelope, &outcome.rate_limit, 0);
    state.metrics().record_request(started.elapsed());
    response
}

/// Buffer the body, keeping at most `max + 1` bytes so oversize is detectable
async fn read_body(body: Body, max: usize, scope: &RequestScope) -> Result<Bytes, BlockReason> {
    let collect = async {
        let mut stream = body.into_data_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                BlockReason::new(DenialKind::Malformed, format!("failed to read request body: {}", e))
            })?;
            let room = (max + 1).saturating_sub(buffer.len());
            buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if buffer.len() > max {
                break;
            }
        }
        Ok(buffer.freeze())
    };

    match scope.run(collect).await {
        Ok(result) => result,
        Err(e) => Err(interrupted(e)),
    }
}

fn set_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Emits the cancellation event if the request future is dropped early
struct CancelGuard {
    monitor: SecurityMonitor,
    scope: RequestScope,
    event: Option<SecurityEvent>,
    armed: bool,
}

impl CancelGuard {
    fn new(monitor: SecurityMonitor, scope: RequestScope) -> Self {
        Self {
            monitor,
            scope,
            event: None,
            armed: true,
        }
    }

    fn track(&mut self, request: &SecurityRequest) {
        self.event = Some(
            SecurityEvent::new(
                EventType::NetworkActivity,
                Severity::Info,
                GATEWAY_SOURCE,
                "request cancelled by client",
            )
            .with_request(request)
            .with_metadata("status", "cancelled"),
        );
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.scope.cancel();
        let event = self.event.take().unwrap_or_else(|| {
            SecurityEvent::new(
                EventType::NetworkActivity,
                Severity::Info,
                GATEWAY_SOURCE,
                "request cancelled by client",
            )
            .with_metadata("status", "cancelled")
        });
        debug!(request_id = ?event.request_id(), "Request cancelled before completion");
        self.monitor.log_event(event);
    }
}
