//! Threat analysis of stored security events.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::core::types::{EventType, Severity, ThreatLevel};
use crate::observability::events::SecurityEvent;

/// Events from one IP inside the window before it counts as repeated activity
const REPEAT_THRESHOLD: usize = 10;
/// Tracked IPs before idle ones are pruned
const MAX_TRACKED_IPS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAnalysis {
    pub threat_level: ThreatLevel,
    pub confidence: f64,
    pub indicators: Vec<String>,
    pub recommendations: Vec<String>,
    pub should_block: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
pub trait ThreatDetector: Send + Sync {
    async fn analyze(&self, event: &SecurityEvent) -> ThreatAnalysis;
}

/// Scores events from their severity, type and how often their IP shows up
pub struct HeuristicThreatDetector {
    window: Duration,
    recent_by_ip: DashMap<String, VecDeque<Instant>>,
}

impl HeuristicThreatDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent_by_ip: DashMap::new(),
        }
    }

    fn observe_ip(&self, ip: &str) -> usize {
        if self.recent_by_ip.len() > MAX_TRACKED_IPS {
            self.prune();
        }
        let now = Instant::now();
        let mut seen = self.recent_by_ip.entry(ip.to_string()).or_default();
        while seen
            .front()
            .map_or(false, |t| now.duration_since(*t) > self.window)
        {
            seen.pop_front();
        }
        seen.push_back(now);
        seen.len()
    }

    /// Drop IPs with no activity inside the window
    pub fn prune(&self) {
        let now = Instant::now();
        self.recent_by_ip.retain(|_, seen| {
            seen.back()
                .map_or(false, |t| now.duration_since(*t) <= self.window)
        });
    }
}

fn raise(level: ThreatLevel) -> ThreatLevel {
    match level {
        ThreatLevel::None => ThreatLevel::Low,
        ThreatLevel::Low => ThreatLevel::Medium,
        ThreatLevel::Medium => ThreatLevel::High,
        ThreatLevel::High | ThreatLevel::Critical => ThreatLevel::Critical,
    }
}

#[async_trait]
impl ThreatDetector for HeuristicThreatDetector {
    async fn analyze(&self, event: &SecurityEvent) -> ThreatAnalysis {
        let mut indicators = Vec::new();
        let mut metadata = BTreeMap::new();

        let (mut level, mut confidence) = match event.severity {
            Severity::Critical => (ThreatLevel::Critical, 0.9),
            Severity::High => (ThreatLevel::High, 0.7),
            Severity::Medium => (ThreatLevel::Medium, 0.5),
            Severity::Low => (ThreatLevel::Low, 0.3),
            Severity::Info => (ThreatLevel::None, 0.1),
        };
        level = level.max(event.threat_level);

        match event.event_type {
            EventType::MaliciousActivity => {
                indicators.push("malicious-activity".to_string());
                level = level.max(ThreatLevel::Medium);
            }
            EventType::PrivilegeEscalation => {
                indicators.push("privilege_escalation".to_string());
                level = level.max(ThreatLevel::High);
                confidence = f64::max(confidence, 0.8);
            }
            _ => {}
        }

        if let Some(rule) = event.metadata.get("rule").and_then(|v| v.as_str()) {
            indicators.push(format!("waf_rule:{}", rule));
        }

        if event.severity > Severity::Info {
            if let Some(ip) = event.ip_address.as_deref() {
                let count = self.observe_ip(ip);
                metadata.insert("ip_event_count".to_string(), count.into());
                if count >= REPEAT_THRESHOLD {
                    indicators.push("repeated_activity_from_ip".to_string());
                    level = raise(level);
                    confidence = f64::min(confidence + 0.1, 1.0);
                }
            }
        }

        let mut recommendations = Vec::new();
        if level >= ThreatLevel::High {
            recommendations.push("block source IP".to_string());
            recommendations.push("review related events".to_string());
        } else if level >= ThreatLevel::Medium {
            recommendations.push("monitor source IP".to_string());
        }

        ThreatAnalysis {
            threat_level: level,
            confidence,
            indicators,
            recommendations,
            should_block: level >= ThreatLevel::High,
            metadata,
        }
    }
}
