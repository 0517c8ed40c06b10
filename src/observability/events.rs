//! # Security Events
//!
//! The [`SecurityEvent`] record and the [`EventStore`] that persists it in the
//! shared key-value store.
//!
//! ## Key layout
//! - `security:events:<id>`: serialized event, expires after the retention period
//! - `security:events:time:<YYYY-MM-DD>`: event ids scored by Unix seconds
//! - `security:events:type:<type>`: same, per event type
//! - `security:events:severity:<sev>`: same, per severity
//!
//! The value and its three index memberships are written in one atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::GatewayResult;
use crate::core::types::{EventType, SecurityRequest, Severity, ThreatLevel};
use crate::store::{IndexEntry, IndexedWrite, KvStore};

pub const EVENT_KEY_PREFIX: &str = "security:events:";
const DEFAULT_QUERY_LIMIT: usize = 100;

/// Source recorded on events produced by the request pipeline
pub const GATEWAY_SOURCE: &str = "security-gateway";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub threat_level: ThreatLevel,
    pub mitigated: bool,
}

impl SecurityEvent {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            severity,
            source: source.into(),
            user_id: None,
            ip_address: None,
            user_agent: None,
            description: description.into(),
            metadata: BTreeMap::new(),
            threat_level: severity.to_threat(),
            mitigated: false,
        }
    }

    /// Copy the request's identity fields into the event
    pub fn with_request(mut self, request: &SecurityRequest) -> Self {
        self.user_id = request.user_id.clone();
        self.ip_address = Some(request.ip.to_string());
        self.user_agent = request.user_agent.clone();
        self.metadata.insert("request_id".into(), request.id.clone().into());
        self.metadata
            .insert("correlation_id".into(), request.correlation_id.clone().into());
        self.metadata
            .insert("method".into(), request.method.as_str().to_string().into());
        self.metadata.insert("path".into(), request.path.clone().into());
        self.metadata
            .insert("fingerprint".into(), request.fingerprint().into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_threat_level(mut self, level: ThreatLevel) -> Self {
        self.threat_level = level;
        self
    }

    pub fn mitigated(mut self, mitigated: bool) -> Self {
        self.mitigated = mitigated;
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.metadata.get("request_id").and_then(|v| v.as_str())
    }

    fn score(&self) -> f64 {
        self.timestamp.timestamp() as f64
    }
}

/// Filters for [`EventStore::query`]; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_id: Option<String>,
    /// Defaults to 100
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, event: &SecurityEvent) -> bool {
        self.event_type.map_or(true, |t| event.event_type == t)
            && self.severity.map_or(true, |s| event.severity == s)
            && self.start_time.map_or(true, |start| event.timestamp >= start)
            && self.end_time.map_or(true, |end| event.timestamp <= end)
            && self
                .ip_address
                .as_ref()
                .map_or(true, |ip| event.ip_address.as_ref() == Some(ip))
            && self
                .user_id
                .as_ref()
                .map_or(true, |user| event.user_id.as_ref() == Some(user))
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn store(&self, event: &SecurityEvent) -> GatewayResult<()>;

    async fn get(&self, id: &str) -> GatewayResult<Option<SecurityEvent>>;

    /// Matching events, newest first
    async fn query(&self, filter: &EventFilter) -> GatewayResult<Vec<SecurityEvent>>;

    /// Remove events older than `older_than`; returns how many were removed
    async fn delete(&self, older_than: DateTime<Utc>) -> GatewayResult<usize>;
}

fn event_key(id: &str) -> String {
    format!("{}{}", EVENT_KEY_PREFIX, id)
}

fn day_index(date: NaiveDate) -> String {
    format!("{}time:{}", EVENT_KEY_PREFIX, date.format("%Y-%m-%d"))
}

fn type_index(event_type: EventType) -> String {
    format!("{}type:{}", EVENT_KEY_PREFIX, event_type.as_str())
}

fn severity_index(severity: Severity) -> String {
    format!("{}severity:{}", EVENT_KEY_PREFIX, severity.as_str())
}

fn index_memberships(event: &SecurityEvent) -> [String; 3] {
    [
        day_index(event.timestamp.date_naive()),
        type_index(event.event_type),
        severity_index(event.severity),
    ]
}

/// [`EventStore`] over a [`KvStore`]
pub struct KvEventStore {
    store: Arc<dyn KvStore>,
    retention: Duration,
}

impl KvEventStore {
    pub fn new(store: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    fn retention_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.retention).unwrap_or_else(|_| ChronoDuration::days(30))
    }

    async fn candidate_ids(&self, filter: &EventFilter) -> GatewayResult<Vec<String>> {
        let min = filter
            .start_time
            .map_or(f64::NEG_INFINITY, |t| t.timestamp() as f64);
        let max = filter
            .end_time
            .map_or(f64::INFINITY, |t| t.timestamp() as f64);

        if let Some(event_type) = filter.event_type {
            return Ok(self.store.zrange_by_score(&type_index(event_type), min, max).await?);
        }
        if let Some(severity) = filter.severity {
            return Ok(self.store.zrange_by_score(&severity_index(severity), min, max).await?);
        }

        // Walk the daily indexes inside the requested (or retained) range
        let end = filter.end_time.unwrap_or_else(Utc::now);
        let earliest = Utc::now() - self.retention_chrono();
        let start = filter.start_time.map_or(earliest, |s| s.max(earliest));

        let mut ids = Vec::new();
        let mut day = start.date_naive();
        let last = end.date_naive();
        while day <= last {
            ids.extend(self.store.zrange_by_score(&day_index(day), min, max).await?);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        Ok(ids)
    }

    async fn load(&self, id: &str) -> GatewayResult<Option<SecurityEvent>> {
        match self.store.get(&event_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EventStore for KvEventStore {
    async fn store(&self, event: &SecurityEvent) -> GatewayResult<()> {
        let value = serde_json::to_string(event)?;
        let score = event.score();
        let indexes = index_memberships(event)
            .into_iter()
            .map(|key| IndexEntry {
                key,
                member: event.id.clone(),
                score,
                ttl: Some(self.retention),
            })
            .collect();

        self.store
            .write_indexed(&IndexedWrite {
                key: event_key(&event.id),
                value,
                ttl: Some(self.retention),
                indexes,
            })
            .await?;

        debug!(event_id = %event.id, event_type = %event.event_type, "Security event stored");
        Ok(())
    }

    async fn get(&self, id: &str) -> GatewayResult<Option<SecurityEvent>> {
        self.load(id).await
    }

    async fn query(&self, filter: &EventFilter) -> GatewayResult<Vec<SecurityEvent>> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let ids = self.candidate_ids(filter).await?;

        let mut events = Vec::with_capacity(ids.len().min(limit));
        for id in ids {
            // Index members can outlive their expired value
            if let Some(event) = self.load(&id).await? {
                if filter.matches(&event) {
                    events.push(event);
                }
            }
        }

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.dedup_by(|a, b| a.id == b.id);
        events.truncate(limit);
        Ok(events)
    }

    async fn delete(&self, older_than: DateTime<Utc>) -> GatewayResult<usize> {
        let keys = self.store.scan_prefix(EVENT_KEY_PREFIX).await?;
        let mut removed = 0;

        for key in keys {
            let Some(id) = key.strip_prefix(EVENT_KEY_PREFIX) else {
                continue;
            };
            if id.contains(':') {
                continue;
            }

            let event = match self.load(id).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable security event");
                    continue;
                }
            };
            if event.timestamp >= older_than {
                continue;
            }

            let memberships: Vec<(String, String)> = index_memberships(&event)
                .into_iter()
                .map(|index| (index, event.id.clone()))
                .collect();
            self.store.delete_indexed(&key, &memberships).await?;
            removed += 1;
        }

        debug!(removed, cutoff = %older_than, "Old security events deleted");
        Ok(removed)
    }
}
