//! # Security Pipeline
//!
//! Runs the inspection stages over one request envelope, strictly in order:
//!
//! 1. request size (decided when the envelope is built)
//! 2. rate limiter (ip, user, endpoint, global)
//! 3. WAF
//! 4. input validator (url, header values, body)
//! 5. authentication, post-authentication user budget, authorization
//!
//! The first stage that does not allow ends the pass. Every stage records a
//! [`SecurityCheck`] on the envelope. Stage failures come back as a verdict with
//! a typed [`DenialKind`]; raw errors never leave this module.
//!
//! A pipeline is immutable once built. Configuration reloads build a new one and
//! swap it in; in-flight requests finish on the pipeline they started with.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, CredentialVerifier, Identity, PlaceholderVerifier, PolicyDecisionPoint};
use crate::core::config::GatewayConfig;
use crate::core::context::{RequestScope, ScopeError};
use crate::core::error::GatewayResult;
use crate::core::types::{
    BlockReason, CheckType, DenialKind, EventType, RateLimitInfo, SecurityCheck, SecurityRequest,
    Severity, ThreatLevel, Verdict,
};
use crate::gateway::proxy::UpstreamProxy;
use crate::middleware::rate_limiting::{MultiCheckResult, RateLimitError, RateLimiter};
use crate::observability::events::GATEWAY_SOURCE;
use crate::observability::{DataSanitizer, SecurityEvent, SecurityMonitor};
use crate::security::validation::ValidationResult;
use crate::security::waf::{GeoResolver, IpReputation, RuleAction};
use crate::security::{InputValidator, WafEngine};
use crate::store::KvStore;

/// Long-lived collaborators shared by every pipeline generation
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn KvStore>,
    pub monitor: SecurityMonitor,
    pub reputation: Arc<IpReputation>,
    pub geo: Arc<dyn GeoResolver>,
    /// Defaults to the placeholder verifier built from `auth.min_token_length`
    pub verifier: Option<Arc<dyn CredentialVerifier>>,
    pub policy: Arc<dyn PolicyDecisionPoint>,
}

/// Result of one pass over a request
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub verdict: Verdict,
    pub rate_limit: RateLimitInfo,
    pub waf_score: u32,
    pub identity: Option<Identity>,
    /// Store error seen while the rate limiter failed open
    pub degraded: Option<String>,
}

pub struct SecurityPipeline {
    config: Arc<GatewayConfig>,
    limiter: Arc<RateLimiter>,
    waf: WafEngine,
    validator: InputValidator,
    auth: AuthGate,
    proxy: UpstreamProxy,
    monitor: SecurityMonitor,
    sanitizer: DataSanitizer,
    cleanup: CancellationToken,
}

impl SecurityPipeline {
    /// Compile every stage from `config` and start the rate-limit cleanup task
    pub fn build(config: Arc<GatewayConfig>, deps: &PipelineDeps) -> GatewayResult<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            Arc::clone(&deps.store),
        ));

        let waf = WafEngine::new(
            &config.waf,
            config.server.max_request_size,
            Arc::clone(&deps.reputation),
        )?
        .with_geo_resolver(Arc::clone(&deps.geo));

        let validator = InputValidator::new(&config.validation)?;

        let verifier = deps.verifier.clone().unwrap_or_else(|| {
            Arc::new(PlaceholderVerifier::new(config.auth.min_token_length)) as Arc<dyn CredentialVerifier>
        });
        let auth = AuthGate::new(&config.auth, verifier, Arc::clone(&deps.policy));

        let proxy = UpstreamProxy::new(&config.services, config.server.timeout)?;
        let sanitizer = DataSanitizer::standard()?;

        let cleanup = CancellationToken::new();
        limiter.spawn_cleanup(cleanup.clone());

        info!(
            rules = waf.rules().enabled().count(),
            services = config.services.len(),
            auth_enabled = auth.is_enabled(),
            "Security pipeline built"
        );

        Ok(Self {
            config,
            limiter,
            waf,
            validator,
            auth,
            proxy,
            monitor: deps.monitor.clone(),
            sanitizer,
            cleanup,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    pub fn proxy(&self) -> &UpstreamProxy {
        &self.proxy
    }

    /// Stop background work owned by this generation
    pub fn retire(&self) {
        self.cleanup.cancel();
    }

    fn initial_outcome(&self) -> PipelineOutcome {
        let ip_limit = self.limiter.config().limit_for("ip");
        PipelineOutcome {
            verdict: Verdict::Allow,
            rate_limit: RateLimitInfo::unlimited(ip_limit.requests, ip_limit.window),
            waf_score: 0,
            identity: None,
            degraded: None,
        }
    }

    /// Outcome for a request denied before any stage ran
    pub fn short_circuit(&self, request: &mut SecurityRequest, reason: BlockReason) -> PipelineOutcome {
        finish(request, self.initial_outcome(), Verdict::Block(reason))
    }

    /// Run every stage over `request`, stopping at the first non-allow verdict
    pub async fn evaluate(&self, request: &mut SecurityRequest, scope: &RequestScope) -> PipelineOutcome {
        let mut outcome = self.initial_outcome();

        if request.is_blocked() {
            let message = request.block_reason().unwrap_or("request size exceeded").to_string();
            return finish(
                request,
                outcome,
                Verdict::Block(BlockReason::new(DenialKind::PayloadTooLarge, message)),
            );
        }

        let verdict = self.rate_limit_stage(request, scope, &mut outcome).await;
        if !verdict.is_allow() {
            return finish(request, outcome, verdict);
        }

        let verdict = self.waf_stage(request, scope, &mut outcome);
        if !verdict.is_allow() {
            return finish(request, outcome, verdict);
        }

        let verdict = self.validation_stage(request);
        if !verdict.is_allow() {
            return finish(request, outcome, verdict);
        }

        let verdict = self.auth_stage(request, scope, &mut outcome).await;
        finish(request, outcome, verdict)
    }

    async fn rate_limit_stage(
        &self,
        request: &mut SecurityRequest,
        scope: &RequestScope,
        outcome: &mut PipelineOutcome,
    ) -> Verdict {
        let started = Instant::now();
        let result = self.limiter.check_multi(request, scope).await;
        self.apply_rate_limit(request, outcome, result, started)
    }

    fn apply_rate_limit(
        &self,
        request: &mut SecurityRequest,
        outcome: &mut PipelineOutcome,
        result: Result<MultiCheckResult, RateLimitError>,
        started: Instant,
    ) -> Verdict {
        let result = match result {
            Ok(result) => result,
            Err(RateLimitError::Interrupted(e)) => {
                request.add_check(SecurityCheck::blocked(
                    "rate_limit",
                    CheckType::RateLimit,
                    e.to_string(),
                    started.elapsed(),
                ));
                return Verdict::Block(interrupted(e));
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Rate limiter failed closed");
                request.add_check(SecurityCheck::blocked(
                    "rate_limit",
                    CheckType::RateLimit,
                    e.to_string(),
                    started.elapsed(),
                ));
                return Verdict::Block(BlockReason::new(DenialKind::Internal, "rate limiter unavailable"));
            }
        };

        if result.keys_checked > 0 && result.info.remaining <= outcome.rate_limit.remaining {
            outcome.rate_limit = result.info.clone();
        }

        if let Some(error) = &result.degraded {
            request.add_check(
                SecurityCheck::warning(
                    "rate_limit",
                    CheckType::RateLimit,
                    "rate limiter degraded, failing open",
                    started.elapsed(),
                )
                .with_metadata("error", error.clone()),
            );
            outcome.degraded.get_or_insert_with(|| error.clone());
        }

        if result.allowed {
            if result.degraded.is_none() {
                request.add_check(
                    SecurityCheck::passed(
                        "rate_limit",
                        CheckType::RateLimit,
                        "within rate limits",
                        started.elapsed(),
                    )
                    .with_metadata("keys_checked", result.keys_checked),
                );
            }
            return Verdict::Allow;
        }

        let denied_key = result.denied_key.unwrap_or_default();
        debug!(request_id = %request.id, key = %denied_key, "Rate limit exceeded");
        request.add_check(
            SecurityCheck::blocked(
                "rate_limit",
                CheckType::RateLimit,
                "rate limit exceeded",
                started.elapsed(),
            )
            .with_metadata("key", denied_key),
        );
        outcome.rate_limit = result.info.clone();
        Verdict::Block(
            BlockReason::new(DenialKind::RateLimited, "Rate limit exceeded")
                .with_retry_after(result.info.window.as_secs()),
        )
    }

    fn waf_stage(
        &self,
        request: &mut SecurityRequest,
        scope: &RequestScope,
        outcome: &mut PipelineOutcome,
    ) -> Verdict {
        if scope.is_cancelled() {
            return Verdict::Block(interrupted(ScopeError::Cancelled));
        }
        if scope.remaining().is_zero() {
            return Verdict::Block(interrupted(ScopeError::DeadlineExceeded));
        }

        let started = Instant::now();
        let result = self.waf.check(request);
        outcome.waf_score = result.score;
        request.add_risk(result.score as f64);

        let verdict = result.verdict().clone();
        match &verdict {
            Verdict::Allow => {
                let mut matched = 0;
                for rule in result.passive_matches() {
                    matched += 1;
                    let event = SecurityEvent::new(
                        EventType::MaliciousActivity,
                        rule.severity,
                        GATEWAY_SOURCE,
                        format!("WAF rule matched: {}", rule.rule_name),
                    )
                    .with_request(request)
                    .with_metadata("rule", rule.rule_id.clone())
                    .with_metadata("action", rule_action(rule.action))
                    .with_metadata("matched_in", rule.matched_in.clone())
                    .with_metadata("score", rule.score);
                    self.monitor.log_event(event);
                }

                let check = if matched > 0 {
                    SecurityCheck::warning("waf", CheckType::Waf, "WAF rules matched", started.elapsed())
                } else {
                    SecurityCheck::passed("waf", CheckType::Waf, "no WAF rules matched", started.elapsed())
                };
                request.add_check(check.with_metadata("score", result.score));
            }
            Verdict::Block(reason) | Verdict::Challenge(reason) => {
                request.add_check(
                    SecurityCheck::blocked("waf", CheckType::Waf, reason.message.clone(), started.elapsed())
                        .with_metadata("score", result.score)
                        .with_metadata("rule", result.rule_matched.clone().unwrap_or_default())
                        .with_metadata("details", serde_json::Value::Object(result.details.clone())),
                );
            }
        }

        verdict
    }

    fn validation_stage(&self, request: &mut SecurityRequest) -> Verdict {
        let started = Instant::now();

        let host = request.header("host").unwrap_or("localhost");
        let url = format!("http://{}{}", host, request.url);
        let url_result = self.validator.validate_url(&url);
        if let Some(reason) = validation_failure("url", &url_result) {
            return self.validation_blocked(request, reason, started);
        }

        let mut failure = None;
        for (name, value) in &request.headers {
            let result = self.validator.validate_input(value);
            if let Some(reason) = validation_failure(&format!("header {}", name), &result) {
                failure = Some(reason);
                break;
            }
        }
        if let Some(reason) = failure {
            return self.validation_blocked(request, reason, started);
        }

        if !request.body.is_empty() {
            let body = String::from_utf8_lossy(&request.body);
            let result = self.validator.validate_input(&body);
            if let Some(reason) = validation_failure("body", &result) {
                return self.validation_blocked(request, reason, started);
            }
        }

        request.add_check(SecurityCheck::passed(
            "input_validation",
            CheckType::Validation,
            "input valid",
            started.elapsed(),
        ));
        Verdict::Allow
    }

    fn validation_blocked(&self, request: &mut SecurityRequest, reason: BlockReason, started: Instant) -> Verdict {
        request.add_check(SecurityCheck::blocked(
            "input_validation",
            CheckType::Validation,
            reason.message.clone(),
            started.elapsed(),
        ));
        Verdict::Block(reason)
    }

    async fn auth_stage(
        &self,
        request: &mut SecurityRequest,
        scope: &RequestScope,
        outcome: &mut PipelineOutcome,
    ) -> Verdict {
        if !self.auth.applies_to(request) {
            request.add_check(SecurityCheck::skipped(
                "authentication",
                CheckType::Authentication,
                "public endpoint or authentication disabled",
            ));
            return Verdict::Allow;
        }

        let started = Instant::now();
        let identity = match scope.run(self.auth.authenticate(request)).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(reason)) => {
                request.add_check(SecurityCheck::blocked(
                    "authentication",
                    CheckType::Authentication,
                    reason.message.clone(),
                    started.elapsed(),
                ));
                return Verdict::Block(reason);
            }
            Err(e) => return Verdict::Block(interrupted(e)),
        };

        request.user_id = identity.user_id.clone();
        request.tenant_id = identity.tenant_id.clone();
        request.session_id = identity.session_id.clone();
        request.add_check(SecurityCheck::passed(
            "authentication",
            CheckType::Authentication,
            "credential accepted",
            started.elapsed(),
        ));
        info!(
            request_id = %request.id,
            user_id = ?request.user_id,
            tenant_id = ?request.tenant_id,
            "Request authenticated"
        );

        if let Some(user_id) = request.user_id.clone() {
            let started = Instant::now();
            let result = self.limiter.check_user(&user_id, scope).await;
            let verdict = self.apply_rate_limit(request, outcome, result, started);
            if !verdict.is_allow() {
                return verdict;
            }
        }

        let started = Instant::now();
        match scope.run(self.auth.authorize(&identity, request)).await {
            Ok(Ok(())) => {
                request.add_check(SecurityCheck::passed(
                    "authorization",
                    CheckType::Authorization,
                    "access granted",
                    started.elapsed(),
                ));
            }
            Ok(Err(reason)) => {
                request.add_check(SecurityCheck::blocked(
                    "authorization",
                    CheckType::Authorization,
                    reason.message.clone(),
                    started.elapsed(),
                ));
                return Verdict::Block(reason);
            }
            Err(e) => return Verdict::Block(interrupted(e)),
        }

        outcome.identity = Some(identity);
        Verdict::Allow
    }

    /// Event for an allowed request that passed only because the rate limiter
    /// failed open. Denied requests carry the degradation in their block event.
    pub fn degraded_event(&self, request: &SecurityRequest, outcome: &PipelineOutcome) -> Option<SecurityEvent> {
        let error = outcome.degraded.as_ref()?;
        Some(
            SecurityEvent::new(
                EventType::SystemAccess,
                Severity::High,
                GATEWAY_SOURCE,
                "rate limiter degraded: store unavailable, failing open",
            )
            .with_request(request)
            .with_metadata("component", "rate_limiter")
            .with_metadata("error", error.clone()),
        )
    }

    /// The single event stored for a denied request
    pub fn block_event(&self, request: &SecurityRequest, reason: &BlockReason, outcome: &PipelineOutcome) -> SecurityEvent {
        let waf_score = outcome.waf_score;
        let mut event = SecurityEvent::new(
            reason.event_type(),
            reason.severity,
            GATEWAY_SOURCE,
            reason.message.clone(),
        )
        .with_request(request)
        .with_metadata("reason", reason.message.clone())
        .with_metadata("denial", denial_name(reason.kind))
        .with_metadata("status_code", reason.kind.status_code().as_u16())
        .with_metadata("waf_score", waf_score)
        .with_metadata("risk_score", request.risk_score())
        .with_metadata(
            "headers",
            serde_json::to_value(self.sanitizer.sanitize_headers(&request.headers))
                .unwrap_or(serde_json::Value::Null),
        )
        .with_threat_level(reason.threat_level.max(request.threat_level()))
        .mitigated(true);

        if let Some(rule) = &reason.rule {
            event = event.with_metadata("rule", rule.clone());
        }
        if let Some(service) = &reason.service {
            event = event.with_metadata("service", service.clone());
        }
        if let Some(retry_after) = reason.retry_after {
            event = event.with_metadata("retry_after", retry_after);
        }
        if let Some(error) = &outcome.degraded {
            event = event.with_metadata("rate_limit_degraded", error.clone());
        }
        event
    }
}

/// Close out the pass: a non-allow verdict marks the envelope blocked
fn finish(request: &mut SecurityRequest, mut outcome: PipelineOutcome, verdict: Verdict) -> PipelineOutcome {
    if let Some(reason) = verdict.reason() {
        request.block(reason.message.clone());
        request.raise_threat_level(reason.threat_level);
    }
    outcome.verdict = verdict;
    outcome
}

pub(crate) fn interrupted(error: ScopeError) -> BlockReason {
    match error {
        ScopeError::DeadlineExceeded => BlockReason::new(DenialKind::Timeout, "request deadline exceeded"),
        ScopeError::Cancelled => BlockReason::new(DenialKind::Timeout, "request cancelled"),
    }
}

/// Threat-bearing failures are policy blocks, the rest are malformed input
fn validation_failure(subject: &str, result: &ValidationResult) -> Option<BlockReason> {
    if result.valid {
        return None;
    }
    let detail = result.first_error().unwrap_or("invalid input");
    let message = format!("invalid {}: {}", subject, detail);

    Some(if result.threat_level > ThreatLevel::None {
        BlockReason::new(DenialKind::PolicyBlocked, message)
            .with_severity(Severity::from_threat(result.threat_level))
    } else {
        BlockReason::new(DenialKind::Malformed, message)
    })
}

fn rule_action(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Block => "block",
        RuleAction::Challenge => "challenge",
        RuleAction::Log => "log",
        RuleAction::Allow => "allow",
    }
}

fn denial_name(kind: DenialKind) -> &'static str {
    match kind {
        DenialKind::Malformed => "malformed",
        DenialKind::PayloadTooLarge => "payload_too_large",
        DenialKind::RateLimited => "rate_limited",
        DenialKind::PolicyBlocked => "policy_blocked",
        DenialKind::Challenge => "challenge",
        DenialKind::Unauthenticated => "unauthenticated",
        DenialKind::Forbidden => "forbidden",
        DenialKind::UpstreamFailed => "upstream_failed",
        DenialKind::UpstreamTimeout => "upstream_timeout",
        DenialKind::Timeout => "timeout",
        DenialKind::Overloaded => "overloaded",
        DenialKind::Internal => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAuthenticated;
    use crate::core::config::{MonitoringConfig, ScopeLimit};
    use crate::observability::{HeuristicThreatDetector, KvAlertManager, KvEventStore, SecurityMetrics};
    use crate::security::waf::NoopGeoResolver;
    use crate::store::MemoryStore;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use bytes::Bytes;
    use std::time::Duration;

    const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    fn deps() -> PipelineDeps {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(SecurityMetrics::new());
        let reputation = Arc::new(IpReputation::new());
        let monitor = SecurityMonitor::start(
            MonitoringConfig::default(),
            Arc::new(KvEventStore::new(Arc::clone(&store), Duration::from_secs(3600))),
            Arc::new(KvAlertManager::new(Arc::clone(&store), Arc::clone(&metrics))),
            metrics,
            Arc::new(HeuristicThreatDetector::new(Duration::from_secs(300))),
            Arc::clone(&reputation),
        );
        PipelineDeps {
            store,
            monitor,
            reputation,
            geo: Arc::new(NoopGeoResolver),
            verifier: None,
            policy: Arc::new(AllowAuthenticated),
        }
    }

    fn pipeline(config: GatewayConfig) -> SecurityPipeline {
        SecurityPipeline::build(Arc::new(config), &deps()).unwrap()
    }

    fn request(method: Method, url: &str, body: &'static [u8], max: usize) -> SecurityRequest {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static(BROWSER));
        headers.insert("authorization", HeaderValue::from_static("Bearer 0123456789abcdef"));
        SecurityRequest::from_transport(method, url, &headers, Bytes::from_static(body), "203.0.113.7:5000", max)
    }

    fn scope() -> RequestScope {
        RequestScope::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_clean_request_is_allowed() {
        let pipeline = pipeline(GatewayConfig::default());
        let mut req = request(Method::GET, "/api/v1/orders", b"", 1024);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;

        assert!(outcome.verdict.is_allow());
        assert!(outcome.identity.is_some());
        assert_eq!(outcome.rate_limit.limit, 100);
        assert_eq!(outcome.rate_limit.remaining, 99);
        assert!(!req.is_blocked());
        let names: Vec<_> = req.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["rate_limit", "waf", "input_validation", "authentication", "authorization"]
        );
    }

    #[tokio::test]
    async fn test_oversize_body_short_circuits() {
        let pipeline = pipeline(GatewayConfig::default());
        let mut req = request(Method::POST, "/ingest", b"0123456789", 9);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;

        let reason = outcome.verdict.reason().unwrap();
        assert_eq!(reason.kind, DenialKind::PayloadTooLarge);
        assert_eq!(reason.message, "request size exceeded");
        assert!(req.checks.iter().all(|c| c.name != "rate_limit"));
    }

    #[tokio::test]
    async fn test_ip_budget_exhausted() {
        let mut config = GatewayConfig::default();
        config
            .rate_limit
            .limits
            .insert("ip".to_string(), ScopeLimit::new(2, Duration::from_secs(60)));
        let pipeline = pipeline(config);

        for expected in [1, 0] {
            let mut req = request(Method::GET, "/api/v1/orders", b"", 1024);
            let outcome = pipeline.evaluate(&mut req, &scope()).await;
            assert!(outcome.verdict.is_allow());
            assert_eq!(outcome.rate_limit.remaining, expected);
        }

        let mut req = request(Method::GET, "/api/v1/orders", b"", 1024);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;
        let reason = outcome.verdict.reason().unwrap();
        assert_eq!(reason.kind, DenialKind::RateLimited);
        assert_eq!(reason.retry_after, Some(60));
        assert_eq!(outcome.rate_limit.remaining, 0);
        assert!(req.is_blocked());
    }

    #[tokio::test]
    async fn test_sql_injection_blocked_by_waf() {
        let pipeline = pipeline(GatewayConfig::default());
        let mut req = request(Method::GET, "/api/v1/users?id=1%20UNION%20SELECT%201", b"", 1024);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;

        let reason = outcome.verdict.reason().unwrap();
        assert_eq!(reason.kind, DenialKind::PolicyBlocked);
        assert_eq!(reason.rule.as_deref(), Some("sql_001"));
        assert_eq!(reason.severity, Severity::High);
        assert!(outcome.waf_score >= 80);

        let event = pipeline.block_event(&req, reason, &outcome);
        assert_eq!(event.request_id(), Some(req.id.as_str()));
        assert_eq!(event.metadata["rule"], "sql_001");
        assert_eq!(event.metadata["headers"]["authorization"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_validator_threat_in_body_is_policy_block() {
        let mut config = GatewayConfig::default();
        config.waf.enabled = false;
        let pipeline = pipeline(config);

        let mut req = request(Method::POST, "/api/v1/comments", b"name=x' OR 'a'='a", 1024);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;
        let reason = outcome.verdict.reason().unwrap();
        assert_eq!(reason.kind, DenialKind::PolicyBlocked);
        assert_eq!(reason.severity, Severity::Critical);
        assert!(reason.message.starts_with("invalid body"));
    }

    #[tokio::test]
    async fn test_missing_credentials_unauthenticated() {
        let pipeline = pipeline(GatewayConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static(BROWSER));
        let mut req = SecurityRequest::from_transport(
            Method::GET,
            "/api/v1/orders",
            &headers,
            Bytes::new(),
            "203.0.113.7:5000",
            1024,
        );
        let outcome = pipeline.evaluate(&mut req, &scope()).await;
        assert_eq!(outcome.verdict.reason().unwrap().kind, DenialKind::Unauthenticated);

        let mut req = SecurityRequest::from_transport(
            Method::GET,
            "/health",
            &headers,
            Bytes::new(),
            "203.0.113.7:5000",
            1024,
        );
        assert!(pipeline.evaluate(&mut req, &scope()).await.verdict.is_allow());
    }

    struct FixedUser;

    #[async_trait::async_trait]
    impl crate::auth::CredentialVerifier for FixedUser {
        async fn verify(&self, _credential: &str) -> crate::core::error::GatewayResult<crate::auth::Identity> {
            Ok(crate::auth::Identity {
                user_id: Some("u-17".to_string()),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_user_budget_applies_after_authentication() {
        let mut config = GatewayConfig::default();
        config
            .rate_limit
            .limits
            .insert("user".to_string(), ScopeLimit::new(1, Duration::from_secs(60)));
        let mut deps = deps();
        deps.verifier = Some(Arc::new(FixedUser));
        let pipeline = SecurityPipeline::build(Arc::new(config), &deps).unwrap();

        let mut req = request(Method::GET, "/api/v1/orders", b"", 1024);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;
        assert!(outcome.verdict.is_allow());
        assert_eq!(req.user_id.as_deref(), Some("u-17"));
        assert_eq!(outcome.rate_limit.remaining, 0);

        let mut req = request(Method::GET, "/api/v1/orders", b"", 1024);
        let outcome = pipeline.evaluate(&mut req, &scope()).await;
        assert_eq!(outcome.verdict.reason().unwrap().kind, DenialKind::RateLimited);
    }

    #[tokio::test]
    async fn test_expired_scope_times_out() {
        let pipeline = pipeline(GatewayConfig::default());
        let mut req = request(Method::GET, "/api/v1/orders", b"", 1024);
        let scope = scope();
        scope.cancel();
        let outcome = pipeline.evaluate(&mut req, &scope).await;
        let reason = outcome.verdict.reason().unwrap();
        assert_eq!(reason.kind, DenialKind::Timeout);
        assert_eq!(reason.message, "request cancelled");
    }
}
