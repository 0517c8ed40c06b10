//! # Upstream Proxy
//!
//! Forwards allowed requests to the service named by the first path segment:
//! `/<service>/<rest>` goes to `<base_url>/<rest>`. The routing table is fixed
//! when the proxy is built; a configuration reload builds a new proxy.
//!
//! The upstream client (`reqwest`) speaks `http` 0.2 while the server side is on
//! `http` 1.x, so method, status and headers cross over as strings and bytes.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::context::{RequestScope, ScopeError};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{BlockReason, DenialKind, CORRELATION_ID_HEADER, REQUEST_ID_HEADER};

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub const GATEWAY_ID_HEADER: &str = "x-gateway";
pub const GATEWAY_VERSION_HEADER: &str = "x-gateway-version";

/// Service name and target URL resolved from a request path
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTarget {
    pub service: String,
    pub url: String,
}

/// Identifiers forwarded to the upstream
#[derive(Debug, Clone)]
pub struct ForwardHeaders<'a> {
    pub request_id: &'a str,
    pub correlation_id: &'a str,
    pub client_ip: &'a str,
}

pub struct UpstreamProxy {
    client: reqwest::Client,
    routes: HashMap<String, String>,
}

impl UpstreamProxy {
    pub fn new(services: &HashMap<String, String>, connect_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build upstream client: {}", e)))?;

        let routes = services
            .iter()
            .map(|(name, base)| (name.clone(), base.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self { client, routes })
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Map `/<service>/<rest>?<query>` onto the service's base URL
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Option<UpstreamTarget> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (service, rest) = match trimmed.find('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
            None => (trimmed, "/"),
        };

        let base = self.routes.get(service)?;
        let mut url = format!("{}{}", base, rest);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        Some(UpstreamTarget {
            service: service.to_string(),
            url,
        })
    }

    /// Send the request upstream and stream the response back.
    ///
    /// Only the exchange up to the response head is bounded by the scope; the
    /// body streams afterwards and is aborted when the client goes away.
    pub async fn forward(
        &self,
        target: &UpstreamTarget,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
        ids: &ForwardHeaders<'_>,
        scope: &RequestScope,
    ) -> Result<Response, BlockReason> {
        let upstream_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|_| {
            BlockReason::new(DenialKind::Malformed, format!("unsupported method {}", method))
        })?;

        let mut builder = self.client.request(upstream_method, &target.url);
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if HOP_BY_HOP_HEADERS.contains(&name)
                || name == REQUEST_ID_HEADER
                || name == CORRELATION_ID_HEADER
            {
                continue;
            }
            builder = builder.header(name, value.as_bytes());
        }

        builder = builder
            .header(GATEWAY_ID_HEADER, "security-gateway")
            .header(GATEWAY_VERSION_HEADER, env!("CARGO_PKG_VERSION"))
            .header(REQUEST_ID_HEADER, ids.request_id)
            .header(CORRELATION_ID_HEADER, ids.correlation_id);
        if !headers.contains_key("x-forwarded-for") {
            builder = builder.header("x-forwarded-for", ids.client_ip);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        debug!(
            request_id = %ids.request_id,
            service = %target.service,
            url = %target.url,
            "Forwarding request upstream"
        );

        let upstream = match scope.run(builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(request_id = %ids.request_id, service = %target.service, error = %e, "Upstream request failed");
                let reason = if e.is_timeout() {
                    BlockReason::new(DenialKind::UpstreamTimeout, "upstream service timed out")
                } else {
                    BlockReason::new(DenialKind::UpstreamFailed, "upstream service unavailable")
                };
                return Err(reason.with_service(target.service.clone()));
            }
            Err(ScopeError::DeadlineExceeded) => {
                warn!(request_id = %ids.request_id, service = %target.service, "Upstream request exceeded deadline");
                return Err(BlockReason::new(DenialKind::UpstreamTimeout, "upstream service timed out")
                    .with_service(target.service.clone()));
            }
            Err(ScopeError::Cancelled) => {
                return Err(BlockReason::new(DenialKind::Timeout, "request cancelled")
                    .with_service(target.service.clone()));
            }
        };

        Ok(into_response(upstream))
    }
}

fn into_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
