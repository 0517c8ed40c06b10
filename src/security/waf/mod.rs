//! # Web Application Firewall
//!
//! Ordered inspection of the request envelope:
//!
//! 1. request size
//! 2. IP lists and the suspicious-IP reputation table
//! 3. geo blocking through a [`GeoResolver`] collaborator
//! 4. bot detection
//! 5. a linear pass over the enabled rules of the compiled [`RuleSet`]
//!
//! A `block` (or `challenge`) rule ends the pass. Other matches add their score;
//! a total of [`SCORE_THRESHOLD`] or more blocks with "high risk score".

pub mod bot;
pub mod ip_list;
pub mod rules;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::WafConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{BlockReason, DenialKind, SecurityRequest, Severity, Verdict};

pub use bot::{BotDetection, BotDetector};
pub use ip_list::{IpLists, IpMatcher, IpReputation};
pub use rules::{CompiledRule, RuleAction, RuleSet, RuleType};

/// Cumulative score at which a request is blocked
pub const SCORE_THRESHOLD: u32 = 100;

/// Longest matched value kept in details and events
const MATCHED_VALUE_LIMIT: usize = 100;

/// Country lookup collaborator; provisioning a database is left to deployments
pub trait GeoResolver: Send + Sync {
    /// ISO 3166-1 alpha-2 code, if known
    fn resolve_country(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver that knows no countries
#[derive(Debug, Default)]
pub struct NoopGeoResolver;

impl GeoResolver for NoopGeoResolver {
    fn resolve_country(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// A rule that matched, blocking or not
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub action: RuleAction,
    pub severity: Severity,
    pub score: u32,
    pub matched_in: String,
    pub matched_value: String,
}

#[derive(Debug, Clone)]
pub struct WafResult {
    pub allowed: bool,
    pub blocked: bool,
    pub reason: Option<String>,
    pub rule_matched: Option<String>,
    pub score: u32,
    pub details: Map<String, Value>,
    pub matches: Vec<RuleMatch>,
    verdict: Verdict,
}

impl WafResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            blocked: false,
            reason: None,
            rule_matched: None,
            score: 0,
            details: Map::new(),
            matches: Vec::new(),
            verdict: Verdict::Allow,
        }
    }

    fn deny(&mut self, reason: BlockReason, challenge: bool) {
        self.allowed = false;
        self.blocked = true;
        self.reason = Some(reason.message.clone());
        self.verdict = if challenge {
            Verdict::Challenge(reason)
        } else {
            Verdict::Block(reason)
        };
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    /// Matches that did not end the pass
    pub fn passive_matches(&self) -> impl Iterator<Item = &RuleMatch> {
        let deciding = if self.blocked {
            self.rule_matched.as_deref()
        } else {
            None
        };
        self.matches
            .iter()
            .filter(move |m| Some(m.rule_id.as_str()) != deciding)
    }
}

fn truncate(value: &str) -> String {
    value.chars().take(MATCHED_VALUE_LIMIT).collect()
}

/// WAF engine; rules are immutable after construction apart from their enable flags
pub struct WafEngine {
    config: WafConfig,
    max_request_size: usize,
    rules: RuleSet,
    ip_lists: RwLock<Arc<IpLists>>,
    reputation: Arc<IpReputation>,
    geo: Arc<dyn GeoResolver>,
    bots: BotDetector,
}

impl WafEngine {
    pub fn new(
        config: &WafConfig,
        max_request_size: usize,
        reputation: Arc<IpReputation>,
    ) -> GatewayResult<Self> {
        let ip_lists = IpLists::from_config(config)
            .map_err(|e| GatewayError::config(format!("Invalid WAF IP list: {}", e)))?;

        Ok(Self {
            config: config.clone(),
            max_request_size,
            rules: RuleSet::with_defaults(&config.rules, &config.disabled_rules),
            ip_lists: RwLock::new(Arc::new(ip_lists)),
            reputation,
            geo: Arc::new(NoopGeoResolver),
            bots: BotDetector,
        })
    }

    pub fn with_geo_resolver(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = geo;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Install new lists; in-flight checks keep the lists they started with
    pub fn replace_ip_lists(&self, lists: IpLists) {
        *self.ip_lists.write() = Arc::new(lists);
    }

    pub fn check(&self, request: &SecurityRequest) -> WafResult {
        let mut result = WafResult::allow();
        if !self.config.enabled {
            return result;
        }

        if request.body.len() > self.max_request_size {
            result.score = SCORE_THRESHOLD;
            result.deny(
                BlockReason::new(DenialKind::PayloadTooLarge, "request size exceeded"),
                false,
            );
            return result;
        }

        if let Some(reason) = self.check_ip(request.ip) {
            result.score = SCORE_THRESHOLD;
            result.details.insert("ip_check".into(), json!(reason));
            result.deny(
                BlockReason::new(DenialKind::PolicyBlocked, reason).with_severity(Severity::High),
                false,
            );
            return result;
        }

        if self.config.enable_geo_blocking {
            if let Some(country) = self.blocked_country(request.ip) {
                result.score = 80;
                result.details.insert("country".into(), json!(country));
                result.deny(
                    BlockReason::new(DenialKind::PolicyBlocked, format!("country {} blocked", country))
                        .with_severity(Severity::Medium),
                    false,
                );
                return result;
            }
        }

        if self.config.enable_bot_detection {
            let detection = self.bots.detect(request.user_agent.as_deref());
            if detection.is_bot && detection.confidence > 0.0 {
                result.details.insert("bot_detection".into(), json!(detection));
                if detection.confidence > 0.8 {
                    result.score += (detection.confidence * 50.0).round() as u32;
                    result.deny(
                        BlockReason::new(DenialKind::PolicyBlocked, "malicious bot detected")
                            .with_severity(Severity::High),
                        false,
                    );
                    return result;
                }
                result.score += (detection.confidence * 50.0).round() as u32;
            }
        }

        let decoded_url = urlencoding::decode(&request.url).unwrap_or(Cow::Borrowed(""));
        for rule in self.rules.enabled() {
            let Some((matched_in, matched_value)) = self.find_match(rule, request, &decoded_url)
            else {
                continue;
            };

            result.score += rule.score;
            result.details.insert(
                rule.id.clone(),
                json!({ "matched_in": matched_in, "matched_value": matched_value }),
            );
            result.matches.push(RuleMatch {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                action: rule.action,
                severity: rule.severity,
                score: rule.score,
                matched_in,
                matched_value,
            });
            debug!(request_id = %request.id, rule_id = %rule.id, "WAF rule matched");

            if matches!(rule.action, RuleAction::Block | RuleAction::Challenge) {
                result.rule_matched = Some(rule.id.clone());
                let reason = BlockReason::new(
                    if rule.action == RuleAction::Challenge {
                        DenialKind::Challenge
                    } else {
                        DenialKind::PolicyBlocked
                    },
                    format!("WAF rule violation: {}", rule.name),
                )
                .with_rule(rule.id.clone())
                .with_severity(rule.severity);
                result.deny(reason, rule.action == RuleAction::Challenge);
                return result;
            }
        }

        if let Some(last) = result.matches.last() {
            result.rule_matched = Some(last.rule_id.clone());
        }

        if result.score >= SCORE_THRESHOLD {
            result.deny(
                BlockReason::new(DenialKind::PolicyBlocked, "high risk score")
                    .with_severity(Severity::High),
                false,
            );
        }

        result
    }

    fn check_ip(&self, ip: IpAddr) -> Option<String> {
        let lists = Arc::clone(&*self.ip_lists.read());
        if let Some(reason) = lists.check(ip) {
            return Some(reason.to_string());
        }
        if self.config.block_suspicious_ip && self.reputation.is_flagged(ip) {
            return Some("IP flagged as suspicious".to_string());
        }
        None
    }

    fn blocked_country(&self, ip: IpAddr) -> Option<String> {
        let country = self.geo.resolve_country(ip)?.to_ascii_uppercase();
        let listed = |list: &[String]| list.iter().any(|c| c.eq_ignore_ascii_case(&country));

        if listed(&self.config.blocked_countries) {
            return Some(country);
        }
        if !self.config.allowed_countries.is_empty() && !listed(&self.config.allowed_countries) {
            return Some(country);
        }
        None
    }

    /// Location and (truncated) value of the first match: url, headers, body
    fn find_match(
        &self,
        rule: &CompiledRule,
        request: &SecurityRequest,
        decoded_url: &str,
    ) -> Option<(String, String)> {
        if rule.rule_type == RuleType::UserAgent {
            return request
                .user_agent
                .as_deref()
                .filter(|ua| rule.is_match(ua))
                .map(|ua| ("user_agent".to_string(), truncate(ua)));
        }

        if rule.is_match(&request.url) {
            return Some(("url".to_string(), truncate(&request.url)));
        }
        if decoded_url != request.url && rule.is_match(decoded_url) {
            return Some(("url".to_string(), truncate(decoded_url)));
        }

        for (name, value) in &request.headers {
            if rule.is_match(value) {
                return Some((format!("header_{}", name), truncate(value)));
            }
        }

        if !request.body.is_empty() {
            let body = String::from_utf8_lossy(&request.body);
            if rule.is_match(&body) {
                return Some(("body".to_string(), truncate(&body)));
            }
        }

        None
    }
}
