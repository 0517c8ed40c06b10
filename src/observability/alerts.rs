//! # Alert Manager
//!
//! Security alerts with a validated status machine, persisted in the shared
//! key-value store.
//!
//! ```text
//! open ──► investigating ──► resolved
//!   │            └─────────► false_positive
//!   ├──────────────────────► resolved
//!   └──────────────────────► false_positive
//! ```
//!
//! Alerts reference events by id only. Open and investigating alerts are members
//! of `security:alerts:active`; leaving that set is final.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Severity;
use crate::observability::metrics::SecurityMetrics;
use crate::store::{IndexEntry, IndexedWrite, KvStore};

const ALERT_KEY_PREFIX: &str = "security:alerts:";
const ACTIVE_SET: &str = "security:alerts:active";
const TIME_INDEX: &str = "security:alerts:time";
const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertType {
    ThresholdExceeded,
    AnomalyDetected,
    ThreatDetected,
    SystemCompromise,
    DataBreach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AlertStatus::Open | AlertStatus::Investigating)
    }

    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Open, Investigating)
                | (Open, Resolved)
                | (Open, FalsePositive)
                | (Investigating, Resolved)
                | (Investigating, FalsePositive)
        )
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Ok(AlertStatus::Open),
            "investigating" => Ok(AlertStatus::Investigating),
            "resolved" => Ok(AlertStatus::Resolved),
            "false_positive" => Ok(AlertStatus::FalsePositive),
            other => Err(format!("unknown alert status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    /// Ids of the events that raised the alert
    #[serde(default)]
    pub events: Vec<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SecurityAlert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity,
            title: title.into(),
            description: description.into(),
            events: Vec::new(),
            status: AlertStatus::Open,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            assigned_to: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<String>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Fields an update may change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertUpdate {
    pub status: Option<AlertStatus>,
    pub assigned_to: Option<String>,
    pub severity: Option<Severity>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Alert capability used by the monitor and the management API
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create(&self, alert: &SecurityAlert) -> GatewayResult<()>;

    async fn update(&self, id: &str, update: AlertUpdate) -> GatewayResult<SecurityAlert>;

    async fn resolve(&self, id: &str, reason: &str) -> GatewayResult<SecurityAlert>;

    async fn get(&self, id: &str) -> GatewayResult<Option<SecurityAlert>>;

    async fn get_active(&self) -> GatewayResult<Vec<SecurityAlert>>;

    /// Newest first
    async fn list(&self, filter: &AlertFilter) -> GatewayResult<Vec<SecurityAlert>>;
}

fn alert_key(id: &str) -> String {
    format!("{}{}", ALERT_KEY_PREFIX, id)
}

fn severity_index(severity: Severity) -> String {
    format!("{}severity:{}", ALERT_KEY_PREFIX, severity.as_str())
}

/// [`AlertSink`] over a [`KvStore`]
pub struct KvAlertManager {
    store: Arc<dyn KvStore>,
    metrics: Arc<SecurityMetrics>,
}

impl KvAlertManager {
    pub fn new(store: Arc<dyn KvStore>, metrics: Arc<SecurityMetrics>) -> Self {
        Self { store, metrics }
    }

    async fn load(&self, id: &str) -> GatewayResult<SecurityAlert> {
        match self.store.get(&alert_key(id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(GatewayError::not_found(format!("alert {}", id))),
        }
    }

    async fn save(&self, alert: &SecurityAlert) -> GatewayResult<()> {
        let value = serde_json::to_string(alert)?;
        self.store.set(&alert_key(&alert.id), &value, None).await?;
        Ok(())
    }

    /// Apply an update after checking the status transition
    async fn apply(&self, id: &str, update: AlertUpdate, reason: Option<&str>) -> GatewayResult<SecurityAlert> {
        let mut alert = self.load(id).await?;
        let previous = alert.status;

        if let Some(next) = update.status {
            if next != previous && !previous.can_transition_to(next) {
                return Err(GatewayError::conflict(format!(
                    "alert {} cannot move from {} to {}",
                    id, previous, next
                )));
            }
            alert.status = next;
        }

        if let Some(assignee) = update.assigned_to {
            alert.assigned_to = Some(assignee);
        }
        if let Some(severity) = update.severity {
            if severity != alert.severity {
                self.store.zrem(&severity_index(alert.severity), &alert.id).await?;
                self.store
                    .zadd(&severity_index(severity), &alert.id, alert.created_at.timestamp() as f64)
                    .await?;
                alert.severity = severity;
            }
        }
        alert.metadata.extend(update.metadata);

        let now = Utc::now();
        alert.updated_at = now;

        let closing = previous.is_active() && !alert.status.is_active();
        if closing {
            alert.resolved_at = Some(now);
            if let Some(reason) = reason {
                alert
                    .metadata
                    .insert("resolution_reason".into(), reason.to_string().into());
            }
        }

        self.save(&alert).await?;
        if closing {
            self.store.srem(ACTIVE_SET, &alert.id).await?;
            self.metrics.record_alert_resolved();
            info!(alert_id = %alert.id, status = %alert.status, "Security alert closed");
        }

        Ok(alert)
    }
}

#[async_trait]
impl AlertSink for KvAlertManager {
    async fn create(&self, alert: &SecurityAlert) -> GatewayResult<()> {
        let value = serde_json::to_string(alert)?;
        let score = alert.created_at.timestamp() as f64;

        self.store
            .write_indexed(&IndexedWrite {
                key: alert_key(&alert.id),
                value,
                ttl: None,
                indexes: vec![
                    IndexEntry {
                        key: TIME_INDEX.to_string(),
                        member: alert.id.clone(),
                        score,
                        ttl: None,
                    },
                    IndexEntry {
                        key: severity_index(alert.severity),
                        member: alert.id.clone(),
                        score,
                        ttl: None,
                    },
                ],
            })
            .await?;

        if alert.status.is_active() {
            self.store.sadd(ACTIVE_SET, &alert.id).await?;
            self.metrics.record_alert_created();
        }

        warn!(
            alert_id = %alert.id,
            alert_type = ?alert.alert_type,
            severity = %alert.severity,
            title = %alert.title,
            "Security alert created"
        );
        Ok(())
    }

    async fn update(&self, id: &str, update: AlertUpdate) -> GatewayResult<SecurityAlert> {
        self.apply(id, update, None).await
    }

    async fn resolve(&self, id: &str, reason: &str) -> GatewayResult<SecurityAlert> {
        let update = AlertUpdate {
            status: Some(AlertStatus::Resolved),
            ..Default::default()
        };
        self.apply(id, update, Some(reason)).await
    }

    async fn get(&self, id: &str) -> GatewayResult<Option<SecurityAlert>> {
        match self.load(id).await {
            Ok(alert) => Ok(Some(alert)),
            Err(GatewayError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_active(&self) -> GatewayResult<Vec<SecurityAlert>> {
        let mut alerts = Vec::new();
        for id in self.store.smembers(ACTIVE_SET).await? {
            match self.load(&id).await {
                Ok(alert) => alerts.push(alert),
                Err(GatewayError::NotFound { .. }) => {
                    warn!(alert_id = %id, "Active alert set references a missing alert");
                }
                Err(e) => return Err(e),
            }
        }
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn list(&self, filter: &AlertFilter) -> GatewayResult<Vec<SecurityAlert>> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let index = filter
            .severity
            .map_or_else(|| TIME_INDEX.to_string(), severity_index);
        let min = filter
            .start_time
            .map_or(f64::NEG_INFINITY, |t| t.timestamp() as f64);
        let max = filter
            .end_time
            .map_or(f64::INFINITY, |t| t.timestamp() as f64);

        let mut ids = self.store.zrange_by_score(&index, min, max).await?;
        ids.reverse();

        let mut alerts = Vec::new();
        for id in ids {
            if alerts.len() >= limit {
                break;
            }
            let alert = match self.load(&id).await {
                Ok(alert) => alert,
                Err(GatewayError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if filter.status.map_or(true, |status| alert.status == status) {
                alerts.push(alert);
            }
        }
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }
}
