//! # Security Metrics
//!
//! Process-local counters updated on every security event and request, with a
//! JSON snapshot for the management API and a Prometheus text exposition.
//!
//! State lives behind one `parking_lot::Mutex` held only for increments and
//! snapshots. The exporter uses its own local recorder, so several gateways in
//! one process (tests) never share counters.

use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::core::types::{EventType, Severity};

/// Samples kept for the rolling response-time average
const RESPONSE_TIME_SAMPLES: usize = 1024;

#[derive(Debug, Default)]
struct MetricsState {
    total_events: u64,
    events_by_type: BTreeMap<EventType, u64>,
    events_by_severity: BTreeMap<Severity, u64>,
    active_alerts: u64,
    resolved_alerts: u64,
    threat_detections: u64,
    blocked_requests: u64,
    total_requests: u64,
    dropped_events: u64,
    response_times: VecDeque<Duration>,
    response_time_sum: Duration,
    last_updated: Option<DateTime<Utc>>,
}

impl MetricsState {
    fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }

    fn average_response_time(&self) -> Duration {
        if self.response_times.is_empty() {
            Duration::ZERO
        } else {
            self.response_time_sum / self.response_times.len() as u32
        }
    }
}

/// Point-in-time copy of the counters, served by `GET /metrics/security`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityMetricsSnapshot {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_severity: BTreeMap<String, u64>,
    pub active_alerts: u64,
    pub resolved_alerts: u64,
    pub threat_detections: u64,
    pub blocked_requests: u64,
    pub total_requests: u64,
    pub dropped_events: u64,
    pub average_response_time_ms: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct SecurityMetrics {
    state: Mutex<MetricsState>,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl SecurityMetrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self {
            state: Mutex::new(MetricsState::default()),
            recorder,
            handle,
        }
    }

    pub fn record_event(&self, event_type: EventType, severity: Severity) {
        let mut state = self.state.lock();
        state.total_events += 1;
        *state.events_by_type.entry(event_type).or_default() += 1;
        *state.events_by_severity.entry(severity).or_default() += 1;
        state.touch();
    }

    pub fn record_alert_created(&self) {
        let mut state = self.state.lock();
        state.active_alerts += 1;
        state.touch();
    }

    /// An alert left the active set (resolved or false positive)
    pub fn record_alert_resolved(&self) {
        let mut state = self.state.lock();
        state.active_alerts = state.active_alerts.saturating_sub(1);
        state.resolved_alerts += 1;
        state.touch();
    }

    pub fn record_threat_detection(&self) {
        let mut state = self.state.lock();
        state.threat_detections += 1;
        state.touch();
    }

    pub fn record_blocked_request(&self) {
        let mut state = self.state.lock();
        state.blocked_requests += 1;
        state.touch();
    }

    /// Event discarded because the writer queue was full
    pub fn record_dropped_event(&self) {
        self.state.lock().dropped_events += 1;
    }

    pub fn record_request(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.total_requests += 1;
        if state.response_times.len() == RESPONSE_TIME_SAMPLES {
            if let Some(oldest) = state.response_times.pop_front() {
                state.response_time_sum = state.response_time_sum.saturating_sub(oldest);
            }
        }
        state.response_times.push_back(duration);
        state.response_time_sum += duration;
        state.touch();
    }

    pub fn snapshot(&self) -> SecurityMetricsSnapshot {
        let state = self.state.lock();
        SecurityMetricsSnapshot {
            total_events: state.total_events,
            events_by_type: state
                .events_by_type
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
            events_by_severity: state
                .events_by_severity
                .iter()
                .map(|(s, n)| (s.as_str().to_string(), *n))
                .collect(),
            active_alerts: state.active_alerts,
            resolved_alerts: state.resolved_alerts,
            threat_detections: state.threat_detections,
            blocked_requests: state.blocked_requests,
            total_requests: state.total_requests,
            dropped_events: state.dropped_events,
            average_response_time_ms: state.average_response_time().as_secs_f64() * 1000.0,
            last_updated: state.last_updated,
        }
    }

    /// Prometheus text exposition of the current counters
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();

        metrics::with_local_recorder(&self.recorder, || {
            metrics::counter!("security_events_total").absolute(snapshot.total_events);
            for (event_type, count) in &snapshot.events_by_type {
                metrics::counter!("security_events_by_type_total", "type" => event_type.clone())
                    .absolute(*count);
            }
            for (severity, count) in &snapshot.events_by_severity {
                metrics::counter!("security_events_by_severity_total", "severity" => severity.clone())
                    .absolute(*count);
            }
            metrics::gauge!("security_alerts_active").set(snapshot.active_alerts as f64);
            metrics::counter!("security_alerts_resolved_total").absolute(snapshot.resolved_alerts);
            metrics::counter!("security_threat_detections_total").absolute(snapshot.threat_detections);
            metrics::counter!("security_blocked_requests_total").absolute(snapshot.blocked_requests);
            metrics::counter!("security_requests_total").absolute(snapshot.total_requests);
            metrics::counter!("security_events_dropped_total").absolute(snapshot.dropped_events);
            metrics::gauge!("security_response_time_avg_ms").set(snapshot.average_response_time_ms);
        });

        self.handle.render()
    }
}

impl Default for SecurityMetrics {
    fn default() -> Self {
        Self::new()
    }
}
