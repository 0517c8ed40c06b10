//! Management endpoints under `/api/v1/security` and the proxy fallback.
//!
//! Management errors are [`GatewayError`]s rendered with the flat JSON body.

use axum::{
    body::to_bytes,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{BlockReason, DenialKind, EventType, Severity};
use crate::gateway::proxy::ForwardHeaders;
use crate::gateway::response::{create_json_response, denial_response};
use crate::gateway::security_layer::{RequestContext, UpstreamFailure};
use crate::gateway::server::AppState;
use crate::middleware::rate_limiting::RateLimitMetricsSnapshot;
use crate::observability::{AlertFilter, AlertStatus, AlertUpdate, EventFilter, SecurityMetricsSnapshot};
use crate::security::validation::{ValidationKind, ValidationResult};

const SERVICE_NAME: &str = "security-gateway";
const DEFAULT_RESOLUTION: &str = "resolved via management API";

/// Health check handler
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Prometheus text exposition
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().render_prometheus(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct SecurityMetricsResponse {
    #[serde(flatten)]
    pub security: SecurityMetricsSnapshot,
    pub rate_limit: RateLimitMetricsSnapshot,
}

pub async fn security_metrics(State(state): State<AppState>) -> Json<SecurityMetricsResponse> {
    Json(SecurityMetricsResponse {
        security: state.metrics().snapshot(),
        rate_limit: state.pipeline().limiter().get_metrics(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

pub async fn validate(
    State(state): State<AppState>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> GatewayResult<Json<ValidationResult>> {
    let Json(request) = payload.map_err(|e| GatewayError::validation("body", e.body_text()))?;
    let kind: ValidationKind = request.kind.parse()?;

    let result = state.pipeline().validator().validate(kind, &request.value);
    debug!(kind = ?kind, valid = result.valid, threat_level = %result.threat_level, "Validation request");
    Ok(Json(result))
}

/// Query string of `GET /alerts`
#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
    pub status: Option<String>,
    pub severity: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl AlertQuery {
    fn into_filter(self) -> GatewayResult<AlertFilter> {
        Ok(AlertFilter {
            status: parse_param::<AlertStatus>("status", self.status.as_deref())?,
            severity: parse_param::<Severity>("severity", self.severity.as_deref())?,
            start_time: parse_time("start_time", self.start_time.as_deref())?,
            end_time: parse_time("end_time", self.end_time.as_deref())?,
            limit: self.limit,
        })
    }
}

pub async fn list_alerts(
    State(state): State<AppState>,
    query: Result<Query<AlertQuery>, QueryRejection>,
) -> GatewayResult<Json<Value>> {
    let Query(query) = query.map_err(|e| GatewayError::validation("query", e.body_text()))?;
    let filter = query.into_filter()?;
    let alerts = state.alerts().list(&filter).await?;
    Ok(Json(json!({ "count": alerts.len(), "alerts": alerts })))
}

pub async fn get_alert(State(state): State<AppState>, Path(id): Path<String>) -> GatewayResult<Response> {
    match state.alerts().get(&id).await? {
        Some(alert) => Ok(Json(alert).into_response()),
        None => Err(GatewayError::not_found(format!("alert {}", id))),
    }
}

pub async fn update_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<AlertUpdate>, JsonRejection>,
) -> GatewayResult<Response> {
    let Json(update) = payload.map_err(|e| GatewayError::validation("body", e.body_text()))?;
    let alert = state.alerts().update(&id, update).await?;
    info!(alert_id = %alert.id, status = %alert.status, "Alert updated");
    Ok(Json(alert).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> GatewayResult<Response> {
    let reason = payload
        .ok()
        .and_then(|Json(body)| body.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string());

    let alert = state.alerts().resolve(&id, &reason).await?;
    info!(alert_id = %alert.id, reason = %reason, "Alert resolved");
    Ok(Json(alert).into_response())
}

/// Query string of `GET /events`
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub ip: Option<String>,
    pub user_id: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<usize>,
}

impl EventQuery {
    fn into_filter(self) -> GatewayResult<EventFilter> {
        Ok(EventFilter {
            event_type: parse_param::<EventType>("type", self.event_type.as_deref())?,
            severity: parse_param::<Severity>("severity", self.severity.as_deref())?,
            start_time: parse_time("start_time", self.start_time.as_deref())?,
            end_time: parse_time("end_time", self.end_time.as_deref())?,
            ip_address: self.ip,
            user_id: self.user_id,
            limit: self.limit,
        })
    }
}

pub async fn query_events(
    State(state): State<AppState>,
    query: Result<Query<EventQuery>, QueryRejection>,
) -> GatewayResult<Json<Value>> {
    let Query(query) = query.map_err(|e| GatewayError::validation("query", e.body_text()))?;
    let filter = query.into_filter()?;
    let events = state.events().query(&filter).await?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

fn parse_param<T>(field: &str, value: Option<&str>) -> GatewayResult<Option<T>>
where
    T: FromStr<Err = String>,
{
    value
        .map(|v| v.parse::<T>().map_err(|e| GatewayError::validation(field, e)))
        .transpose()
}

fn parse_time(field: &str, value: Option<&str>) -> GatewayResult<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| GatewayError::validation(field, format!("expected RFC 3339 timestamp: {}", e)))
        })
        .transpose()
}

/// Fallback: forward `/<service>/<path>` to the configured upstream
pub async fn proxy(Extension(ctx): Extension<RequestContext>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let proxy = ctx.pipeline.proxy();

    let Some(target) = proxy.resolve(parts.uri.path(), parts.uri.query()) else {
        debug!(request_id = %ctx.request_id, path = %parts.uri.path(), "No upstream service for path");
        return create_json_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "Not Found",
                "message": format!("no upstream service for path {}", parts.uri.path()),
                "request_id": ctx.request_id,
            }),
        );
    };

    // the body was buffered by the security layer, so this cannot exceed it
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            let reason = BlockReason::new(DenialKind::Malformed, format!("failed to read request body: {}", e));
            return denial_response(&ctx.request_id, &reason);
        }
    };

    let ids = ForwardHeaders {
        request_id: &ctx.request_id,
        correlation_id: &ctx.correlation_id,
        client_ip: &ctx.client_ip,
    };

    match proxy
        .forward(&target, &parts.method, &parts.headers, body, &ids, &ctx.scope)
        .await
    {
        Ok(response) => response,
        Err(reason) => {
            let mut response = denial_response(&ctx.request_id, &reason);
            response.extensions_mut().insert(UpstreamFailure(reason));
            response
        }
    }
}
