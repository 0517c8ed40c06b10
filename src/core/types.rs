//! # Core Types Module
//!
//! Foundational data structures shared by every pipeline stage: the request
//! envelope ([`SecurityRequest`]), per-stage [`SecurityCheck`] records, the
//! [`Verdict`] a stage hands back, and the small enums (threat level, severity,
//! event type) that flow into events and responses.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - The envelope owns its body as `Bytes`, so cloning it for the proxy is a refcount bump
//! - `blocked` is private: once set, no method can clear it
//! - Enums derive `Ord` so "at least medium" comparisons are plain `>=`

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Header carrying the caller-supplied (or generated) request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Header carrying the correlation id across services
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Longest caller-supplied request id accepted verbatim
const MAX_CALLER_ID_LEN: usize = 128;

/// Threat level attached to requests, validation results and analyses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of security events, alerts and WAF rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Severity proportional to a detected threat level
    pub fn from_threat(level: ThreatLevel) -> Self {
        match level {
            ThreatLevel::None => Severity::Info,
            ThreatLevel::Low => Severity::Low,
            ThreatLevel::Medium => Severity::Medium,
            ThreatLevel::High => Severity::High,
            ThreatLevel::Critical => Severity::Critical,
        }
    }

    pub fn to_threat(self) -> ThreatLevel {
        match self {
            Severity::Info => ThreatLevel::None,
            Severity::Low => ThreatLevel::Low,
            Severity::Medium => ThreatLevel::Medium,
            Severity::High => ThreatLevel::High,
            Severity::Critical => ThreatLevel::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Category of a security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Authentication,
    Authorization,
    DataAccess,
    SystemAccess,
    NetworkActivity,
    MaliciousActivity,
    ConfigChange,
    PrivilegeEscalation,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Authentication,
        EventType::Authorization,
        EventType::DataAccess,
        EventType::SystemAccess,
        EventType::NetworkActivity,
        EventType::MaliciousActivity,
        EventType::ConfigChange,
        EventType::PrivilegeEscalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Authentication => "authentication",
            EventType::Authorization => "authorization",
            EventType::DataAccess => "data-access",
            EventType::SystemAccess => "system-access",
            EventType::NetworkActivity => "network-activity",
            EventType::MaliciousActivity => "malicious-activity",
            EventType::ConfigChange => "config-change",
            EventType::PrivilegeEscalation => "privilege-escalation",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

/// Kind of check a pipeline stage performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Authentication,
    Authorization,
    Validation,
    RateLimit,
    Waf,
    ThreatDetection,
    Encryption,
    Audit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Warning,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckResult {
    Allow,
    Block,
    Warn,
}

/// Record produced by a stage and appended to the request; never mutated afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub status: CheckStatus,
    pub result: CheckResult,
    pub message: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SecurityCheck {
    fn new(
        name: impl Into<String>,
        check_type: CheckType,
        status: CheckStatus,
        result: CheckResult,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            check_type,
            status,
            result,
            message: message.into(),
            duration,
            metadata: HashMap::new(),
        }
    }

    pub fn passed(name: impl Into<String>, check_type: CheckType, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, check_type, CheckStatus::Passed, CheckResult::Allow, message, duration)
    }

    pub fn blocked(name: impl Into<String>, check_type: CheckType, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, check_type, CheckStatus::Failed, CheckResult::Block, message, duration)
    }

    pub fn warning(name: impl Into<String>, check_type: CheckType, message: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, check_type, CheckStatus::Warning, CheckResult::Warn, message, duration)
    }

    pub fn skipped(name: impl Into<String>, check_type: CheckType, message: impl Into<String>) -> Self {
        Self::new(name, check_type, CheckStatus::Skipped, CheckResult::Allow, message, Duration::ZERO)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Rate-limit state reported to callers and rendered as `X-RateLimit-*` headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub blocked: bool,
}

impl RateLimitInfo {
    /// Info reported when no limiter ran (full budget left)
    pub fn unlimited(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_at: Utc::now() + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            window,
            blocked: false,
        }
    }

    /// Unix seconds at which the window resets
    pub fn reset_unix(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Typed reason carried by a blocking verdict; decides status code and event shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    /// Parse failure or bad header
    Malformed,
    PayloadTooLarge,
    RateLimited,
    /// WAF match, validator threat, IP/geo deny
    PolicyBlocked,
    Challenge,
    Unauthenticated,
    Forbidden,
    UpstreamFailed,
    UpstreamTimeout,
    /// Per-request deadline elapsed inside the pipeline
    Timeout,
    Overloaded,
    Internal,
}

impl DenialKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DenialKind::Malformed => StatusCode::BAD_REQUEST,
            DenialKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            DenialKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DenialKind::PolicyBlocked | DenialKind::Challenge | DenialKind::Forbidden => {
                StatusCode::FORBIDDEN
            }
            DenialKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            DenialKind::UpstreamFailed => StatusCode::BAD_GATEWAY,
            DenialKind::UpstreamTimeout | DenialKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DenialKind::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            DenialKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `error` field in denial bodies
    pub fn error_label(&self) -> &'static str {
        match self {
            DenialKind::Challenge => "Challenge Required",
            other => other.status_code().canonical_reason().unwrap_or("Error"),
        }
    }

    /// Event type and minimum severity used when this denial is logged
    pub fn event_shape(&self) -> (EventType, Severity) {
        match self {
            DenialKind::Malformed | DenialKind::PayloadTooLarge => {
                (EventType::MaliciousActivity, Severity::Medium)
            }
            DenialKind::RateLimited => (EventType::MaliciousActivity, Severity::Medium),
            DenialKind::PolicyBlocked | DenialKind::Challenge => {
                (EventType::MaliciousActivity, Severity::Medium)
            }
            DenialKind::Unauthenticated => (EventType::Authentication, Severity::Medium),
            DenialKind::Forbidden => (EventType::Authorization, Severity::Medium),
            DenialKind::UpstreamFailed | DenialKind::UpstreamTimeout | DenialKind::Timeout => {
                (EventType::SystemAccess, Severity::Medium)
            }
            DenialKind::Overloaded => (EventType::SystemAccess, Severity::Medium),
            DenialKind::Internal => (EventType::SystemAccess, Severity::High),
        }
    }
}

/// Why a stage blocked the request
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReason {
    pub kind: DenialKind,
    pub message: String,
    pub rule: Option<String>,
    pub service: Option<String>,
    pub retry_after: Option<u64>,
    /// Severity of the stored event; never below the kind's minimum
    pub severity: Severity,
    pub threat_level: ThreatLevel,
}

impl BlockReason {
    pub fn new(kind: DenialKind, message: impl Into<String>) -> Self {
        let (_, severity) = kind.event_shape();
        Self {
            kind,
            message: message.into(),
            rule: None,
            service: None,
            retry_after: None,
            severity,
            threat_level: severity.to_threat(),
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Raise (never lower) the event severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        let (_, floor) = self.kind.event_shape();
        self.severity = severity.max(floor);
        self.threat_level = self.threat_level.max(severity.to_threat());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_shape().0
    }
}

/// A stage's outcome over a request
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Block(BlockReason),
    Challenge(BlockReason),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn reason(&self) -> Option<&BlockReason> {
        match self {
            Verdict::Allow => None,
            Verdict::Block(reason) | Verdict::Challenge(reason) => Some(reason),
        }
    }
}

/// Canonical in-memory representation of an inbound request used by all stages
#[derive(Debug, Clone)]
pub struct SecurityRequest {
    pub id: String,
    pub correlation_id: String,
    pub method: Method,
    /// Request target as received (path plus optional query)
    pub url: String,
    pub path: String,
    pub query: Option<String>,
    /// Lowercase header name to first value
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    pub checks: Vec<SecurityCheck>,
    pub metadata: HashMap<String, serde_json::Value>,
    threat_level: ThreatLevel,
    risk_score: f64,
    blocked: bool,
    block_reason: Option<String>,
}

impl SecurityRequest {
    /// Build the envelope from transport-level input.
    ///
    /// The body is captured up to `max_request_size` bytes. A larger body is
    /// truncated, a `request_size` block check is recorded and the request is
    /// marked blocked so the pipeline short-circuits.
    pub fn from_transport(
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        remote_address: &str,
        max_request_size: usize,
    ) -> Self {
        let mut header_map = BTreeMap::new();
        for (name, value) in headers.iter() {
            header_map
                .entry(name.as_str().to_ascii_lowercase())
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let id = caller_id(header_map.get(REQUEST_ID_HEADER))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = header_map
            .get(CORRELATION_ID_HEADER)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| id.clone());

        let ip = derive_client_ip(&header_map, remote_address).unwrap_or_else(|| {
            warn!(
                request_id = %id,
                remote_address = %remote_address,
                "Could not derive client IP, using 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });

        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (url.to_string(), None),
        };

        let user_agent = header_map.get("user-agent").cloned();

        let mut request = Self {
            id,
            correlation_id,
            method,
            url: url.to_string(),
            path,
            query,
            headers: header_map,
            body: Bytes::new(),
            ip,
            user_agent,
            timestamp: Utc::now(),
            user_id: None,
            tenant_id: None,
            session_id: None,
            checks: Vec::new(),
            metadata: HashMap::new(),
            threat_level: ThreatLevel::None,
            risk_score: 0.0,
            blocked: false,
            block_reason: None,
        };

        if body.len() > max_request_size {
            let received = body.len();
            request.body = body.slice(..max_request_size);
            request.add_check(
                SecurityCheck::blocked(
                    "request_size",
                    CheckType::Validation,
                    "request size exceeded",
                    Duration::ZERO,
                )
                .with_metadata("max_request_size", max_request_size)
                .with_metadata("received_at_least", received),
            );
            request.block("request size exceeded");
        } else {
            request.body = body;
        }

        request
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn add_check(&mut self, check: SecurityCheck) {
        self.checks.push(check);
    }

    pub fn has_warning(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Warning)
    }

    /// Mark the request blocked; the first reason wins
    pub fn block(&mut self, reason: impl Into<String>) {
        if !self.blocked {
            self.blocked = true;
            self.block_reason = Some(reason.into());
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.block_reason.as_deref()
    }

    /// Raise the threat level; lower levels are ignored
    pub fn raise_threat_level(&mut self, level: ThreatLevel) {
        self.threat_level = self.threat_level.max(level);
    }

    pub fn threat_level(&self) -> ThreatLevel {
        self.threat_level
    }

    pub fn add_risk(&mut self, score: f64) {
        if score > 0.0 {
            self.risk_score += score;
        }
    }

    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    /// Deterministic client fingerprint from ip, user-agent and accept-language
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.ip.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.user_agent.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(self.header("accept-language").unwrap_or("").as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

fn caller_id(value: Option<&String>) -> Option<String> {
    let value = value?.trim();
    let acceptable = !value.is_empty()
        && value.len() <= MAX_CALLER_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic());
    acceptable.then(|| value.to_string())
}

/// First `X-Forwarded-For` entry, else `X-Real-IP`, else the transport peer
pub fn derive_client_ip(headers: &BTreeMap<String, String>, remote_address: &str) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    if real_ip.is_some() {
        return real_ip;
    }

    let remote = remote_address.trim();
    remote
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| remote.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>())
        .ok()
}
