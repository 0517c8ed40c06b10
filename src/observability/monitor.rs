//! # Security Monitor
//!
//! Entry point for security events. Request tasks call
//! [`SecurityMonitor::log_event`], which updates the metrics, writes a log line
//! at a level derived from the severity, and enqueues the event. Info and low
//! events go through a bounded queue and are dropped when it is full; events of
//! medium severity and above use an unbounded queue that is drained first, so
//! every denial is persisted. A single writer task runs the slow work:
//!
//! - persistence through the [`EventStore`] (info/low capped per minute)
//! - rolling-window threshold alerts
//! - threat analysis and `threat-detected` alerts
//! - retries for alert creations that failed
//!
//! Storage and alerting failures are logged; they never reach the request path.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::MonitoringConfig;
use crate::core::types::{EventType, Severity, ThreatLevel};
use crate::observability::alerts::{AlertSink, AlertType, SecurityAlert};
use crate::observability::events::{EventStore, SecurityEvent};
use crate::observability::metrics::SecurityMetrics;
use crate::observability::threat::ThreatDetector;
use crate::security::waf::IpReputation;

const RETRY_TICK: Duration = Duration::from_millis(250);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

enum MonitorCommand {
    Event(Box<SecurityEvent>),
    Flush(oneshot::Sender<()>),
}

/// Cheap-to-clone handle used by request tasks
#[derive(Clone)]
pub struct SecurityMonitor {
    sender: mpsc::Sender<MonitorCommand>,
    priority: mpsc::UnboundedSender<MonitorCommand>,
    metrics: Arc<SecurityMetrics>,
    shutdown: CancellationToken,
    worker: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl SecurityMonitor {
    /// Spawn the writer task and return the handle
    pub fn start(
        config: MonitoringConfig,
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<SecurityMetrics>,
        detector: Arc<dyn ThreatDetector>,
        reputation: Arc<IpReputation>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.event_queue_capacity.max(1));
        let (priority, priority_receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker = MonitorWorker {
            thresholds: ThresholdTracker::default(),
            minute: MinuteCap::default(),
            last_threat_alert: HashMap::new(),
            retries: VecDeque::new(),
            config,
            events,
            alerts,
            metrics: metrics.clone(),
            detector,
            reputation,
        };
        let handle = tokio::spawn(worker.run(receiver, priority_receiver, shutdown.clone()));

        info!("Security monitor started");
        Self {
            sender,
            priority,
            metrics,
            shutdown,
            worker: Arc::new(parking_lot::Mutex::new(Some(handle))),
        }
    }

    pub fn metrics(&self) -> &Arc<SecurityMetrics> {
        &self.metrics
    }

    /// Record, log and enqueue an event. Never blocks; a full queue drops
    /// info and low events only.
    pub fn log_event(&self, event: SecurityEvent) {
        self.metrics.record_event(event.event_type, event.severity);
        log_by_severity(&event);

        if event.severity >= Severity::Medium {
            if self.priority.send(MonitorCommand::Event(Box::new(event))).is_err() {
                debug!("Security monitor stopped, event not persisted");
            }
            return;
        }

        match self.sender.try_send(MonitorCommand::Event(Box::new(event))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_dropped_event();
                warn!("Security event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Security monitor stopped, event not persisted");
            }
        }
    }

    /// Wait until every event enqueued before this call has been processed
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(MonitorCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Drain the queue and stop the writer task
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Security monitor task failed");
            }
        }
        info!("Security monitor stopped");
    }
}

fn log_by_severity(event: &SecurityEvent) {
    let request_id = event.request_id().unwrap_or("-");
    let ip = event.ip_address.as_deref().unwrap_or("-");
    match event.severity {
        Severity::Critical => error!(
            event_id = %event.id, event_type = %event.event_type, severity = %event.severity,
            request_id, client_ip = ip, "{}", event.description
        ),
        Severity::High | Severity::Medium => warn!(
            event_id = %event.id, event_type = %event.event_type, severity = %event.severity,
            request_id, client_ip = ip, "{}", event.description
        ),
        Severity::Low => info!(
            event_id = %event.id, event_type = %event.event_type, severity = %event.severity,
            request_id, client_ip = ip, "{}", event.description
        ),
        Severity::Info => debug!(
            event_id = %event.id, event_type = %event.event_type, severity = %event.severity,
            request_id, client_ip = ip, "{}", event.description
        ),
    }
}

/// Persistence budget for info/low events within the current minute
#[derive(Default)]
struct MinuteCap {
    started: Option<Instant>,
    persisted: u32,
}

impl MinuteCap {
    fn admit(&mut self, max_per_minute: u32) -> bool {
        let now = Instant::now();
        match self.started {
            Some(started) if now.duration_since(started) < Duration::from_secs(60) => {}
            _ => {
                self.started = Some(now);
                self.persisted = 0;
            }
        }
        if self.persisted >= max_per_minute {
            return false;
        }
        self.persisted += 1;
        true
    }
}

/// Rolling-window counter that resets when it fires
#[derive(Default)]
struct RollingCounter {
    hits: VecDeque<Instant>,
}

impl RollingCounter {
    fn hit(&mut self, window: Duration, threshold: u32) -> bool {
        if threshold == 0 {
            return false;
        }
        let now = Instant::now();
        while self
            .hits
            .front()
            .map_or(false, |t| now.duration_since(*t) > window)
        {
            self.hits.pop_front();
        }
        self.hits.push_back(now);
        if self.hits.len() >= threshold as usize {
            self.hits.clear();
            true
        } else {
            false
        }
    }

    fn is_stale(&self, window: Duration) -> bool {
        self.hits
            .back()
            .map_or(true, |t| Instant::now().duration_since(*t) > window)
    }
}

#[derive(Default)]
struct ThresholdTracker {
    failed_auth_by_ip: HashMap<String, RollingCounter>,
    malicious_by_ip: HashMap<String, RollingCounter>,
    high_risk: RollingCounter,
    critical: RollingCounter,
}

impl ThresholdTracker {
    fn prune(&mut self, window: Duration) {
        self.failed_auth_by_ip.retain(|_, c| !c.is_stale(window));
        self.malicious_by_ip.retain(|_, c| !c.is_stale(window));
    }
}

struct PendingAlert {
    alert: SecurityAlert,
    attempts: u32,
    next_attempt: Instant,
}

struct MonitorWorker {
    config: MonitoringConfig,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<SecurityMetrics>,
    detector: Arc<dyn ThreatDetector>,
    reputation: Arc<IpReputation>,
    thresholds: ThresholdTracker,
    minute: MinuteCap,
    last_threat_alert: HashMap<String, Instant>,
    retries: VecDeque<PendingAlert>,
}

impl MonitorWorker {
    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<MonitorCommand>,
        mut priority: mpsc::UnboundedReceiver<MonitorCommand>,
        shutdown: CancellationToken,
    ) {
        let mut retry_tick = tokio::time::interval(RETRY_TICK);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(RETENTION_SWEEP_INTERVAL.min(self.config.retention_period));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = priority.recv() => self.handle(command).await,
                command = receiver.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = retry_tick.tick() => self.retry_due_alerts().await,
                _ = sweep_tick.tick() => self.sweep().await,
            }
        }

        priority.close();
        receiver.close();
        let mut drained = 0usize;
        while let Some(command) = priority.recv().await {
            self.handle(command).await;
            drained += 1;
        }
        while let Some(command) = receiver.recv().await {
            self.handle(command).await;
            drained += 1;
        }
        if !self.retries.is_empty() {
            warn!(pending = self.retries.len(), "Dropping alerts still waiting for retry at shutdown");
        }
        debug!(drained, "Security event queue drained");
    }

    async fn handle(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Event(event) => self.process(*event).await,
            MonitorCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn process(&mut self, event: SecurityEvent) {
        let persist = event.severity >= Severity::Medium
            || self.minute.admit(self.config.max_events_per_minute);
        if persist {
            if let Err(e) = self.events.store(&event).await {
                error!(event_id = %event.id, error = %e, "Failed to store security event");
            }
        } else {
            debug!(event_id = %event.id, "Per-minute event cap reached, not persisting");
        }

        if !self.config.enable_real_time_monitoring {
            return;
        }

        self.check_thresholds(&event).await;

        if self.config.enable_threat_intelligence {
            self.analyze(&event).await;
        }
    }

    async fn check_thresholds(&mut self, event: &SecurityEvent) {
        let thresholds = self.config.alert_thresholds.clone();
        let window = thresholds.time_window;
        let ip = event.ip_address.clone().unwrap_or_default();

        if event.event_type == EventType::Authentication && event.severity >= Severity::Medium {
            let fired = self
                .thresholds
                .failed_auth_by_ip
                .entry(ip.clone())
                .or_default()
                .hit(window, thresholds.failed_login_attempts);
            if fired {
                let alert = SecurityAlert::new(
                    AlertType::ThresholdExceeded,
                    Severity::High,
                    "Repeated authentication failures",
                    format!(
                        "{} failed authentications from {} within {}s",
                        thresholds.failed_login_attempts,
                        ip,
                        window.as_secs()
                    ),
                )
                .with_events(vec![event.id.clone()])
                .with_metadata("ip_address", ip.clone());
                self.raise_alert(alert).await;
            }
        }

        if event.event_type == EventType::MaliciousActivity {
            let fired = self
                .thresholds
                .malicious_by_ip
                .entry(ip.clone())
                .or_default()
                .hit(window, thresholds.suspicious_ip_requests);
            if fired {
                if let Ok(addr) = ip.parse::<IpAddr>() {
                    self.reputation.flag(addr, window);
                }
                let alert = SecurityAlert::new(
                    AlertType::ThresholdExceeded,
                    Severity::High,
                    "Suspicious IP activity",
                    format!(
                        "{} malicious requests from {} within {}s",
                        thresholds.suspicious_ip_requests,
                        ip,
                        window.as_secs()
                    ),
                )
                .with_events(vec![event.id.clone()])
                .with_metadata("ip_address", ip.clone());
                self.raise_alert(alert).await;
            }
        }

        if event.severity >= Severity::High
            && self.thresholds.high_risk.hit(window, thresholds.high_risk_events)
        {
            let alert = SecurityAlert::new(
                AlertType::AnomalyDetected,
                Severity::High,
                "High-risk event volume",
                format!(
                    "{} high-risk events within {}s",
                    thresholds.high_risk_events,
                    window.as_secs()
                ),
            )
            .with_events(vec![event.id.clone()]);
            self.raise_alert(alert).await;
        }

        if event.severity == Severity::Critical
            && self
                .thresholds
                .critical
                .hit(window, thresholds.critical_event_threshold)
        {
            let alert = SecurityAlert::new(
                AlertType::SystemCompromise,
                Severity::Critical,
                "Critical security event",
                event.description.clone(),
            )
            .with_events(vec![event.id.clone()]);
            self.raise_alert(alert).await;
        }
    }

    async fn analyze(&mut self, event: &SecurityEvent) {
        let analysis = self.detector.analyze(event).await;
        if analysis.threat_level < ThreatLevel::High {
            return;
        }
        self.metrics.record_threat_detection();

        // One threat alert per source within the window
        let window = self.config.alert_thresholds.time_window;
        let source = event.ip_address.clone().unwrap_or_default();
        let now = Instant::now();
        if let Some(last) = self.last_threat_alert.get(&source) {
            if now.duration_since(*last) < window {
                return;
            }
        }
        self.last_threat_alert.insert(source.clone(), now);

        let alert = SecurityAlert::new(
            AlertType::ThreatDetected,
            Severity::from_threat(analysis.threat_level),
            "Threat detected",
            event.description.clone(),
        )
        .with_events(vec![event.id.clone()])
        .with_metadata("ip_address", source)
        .with_metadata("confidence", analysis.confidence)
        .with_metadata("indicators", analysis.indicators.clone())
        .with_metadata("recommendations", analysis.recommendations.clone())
        .with_metadata("should_block", analysis.should_block);
        self.raise_alert(alert).await;
    }

    async fn raise_alert(&mut self, alert: SecurityAlert) {
        if let Err(e) = self.alerts.create(&alert).await {
            warn!(alert_id = %alert.id, error = %e, "Alert creation failed, queued for retry");
            self.schedule_retry(alert, 1);
        }
    }

    fn schedule_retry(&mut self, alert: SecurityAlert, attempts: u32) {
        if attempts >= self.config.alert_retry_limit.max(1) {
            error!(alert_id = %alert.id, attempts, "Giving up on alert creation");
            return;
        }
        let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(attempts - 1);
        let jitter = Duration::from_millis(fastrand::u64(0..100));
        self.retries.push_back(PendingAlert {
            alert,
            attempts,
            next_attempt: Instant::now() + backoff + jitter,
        });
    }

    async fn retry_due_alerts(&mut self) {
        if self.retries.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .retries
            .drain(..)
            .partition(|pending| pending.next_attempt <= now);
        self.retries.extend(waiting);

        for pending in due {
            match self.alerts.create(&pending.alert).await {
                Ok(()) => info!(alert_id = %pending.alert.id, "Alert created after retry"),
                Err(e) => {
                    warn!(alert_id = %pending.alert.id, error = %e, attempt = pending.attempts + 1, "Alert retry failed");
                    self.schedule_retry(pending.alert, pending.attempts + 1);
                }
            }
        }
    }

    async fn sweep(&mut self) {
        let window = self.config.alert_thresholds.time_window;
        self.thresholds.prune(window);
        let now = Instant::now();
        self.last_threat_alert
            .retain(|_, last| now.duration_since(*last) < window);

        let retention = chrono::Duration::from_std(self.config.retention_period)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        match self.events.delete(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Expired security events removed"),
            Err(e) => warn!(error = %e, "Security event retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GatewayError, GatewayResult};
    use crate::observability::alerts::{AlertFilter, AlertUpdate, KvAlertManager};
    use crate::observability::events::{EventFilter, KvEventStore, GATEWAY_SOURCE};
    use crate::observability::threat::HeuristicThreatDetector;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        monitor: SecurityMonitor,
        events: Arc<KvEventStore>,
        alerts: Arc<KvAlertManager>,
        reputation: Arc<IpReputation>,
    }

    fn harness(config: MonitoringConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(SecurityMetrics::new());
        let events = Arc::new(KvEventStore::new(store.clone(), config.retention_period));
        let alerts = Arc::new(KvAlertManager::new(store, metrics.clone()));
        let reputation = Arc::new(IpReputation::new());
        let monitor = SecurityMonitor::start(
            config.clone(),
            events.clone(),
            alerts.clone(),
            metrics,
            Arc::new(HeuristicThreatDetector::new(config.alert_thresholds.time_window)),
            reputation.clone(),
        );
        Harness {
            monitor,
            events,
            alerts,
            reputation,
        }
    }

    fn event(event_type: EventType, severity: Severity, ip: &str) -> SecurityEvent {
        let mut event = SecurityEvent::new(event_type, severity, GATEWAY_SOURCE, "test event");
        event.ip_address = Some(ip.to_string());
        event
    }

    #[tokio::test]
    async fn test_events_are_persisted_and_counted() {
        let h = harness(MonitoringConfig::default());
        h.monitor
            .log_event(event(EventType::MaliciousActivity, Severity::Medium, "192.0.2.1"));
        h.monitor.flush().await;

        let stored = h.events.query(&EventFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(h.monitor.metrics().snapshot().total_events, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_low_severity() {
        let mut config = MonitoringConfig::default();
        config.event_queue_capacity = 1;
        let h = harness(config);

        // no await between sends, so the writer cannot drain the queue
        for _ in 0..3 {
            h.monitor
                .log_event(event(EventType::NetworkActivity, Severity::Info, "192.0.2.1"));
        }
        h.monitor
            .log_event(event(EventType::MaliciousActivity, Severity::High, "192.0.2.1"));
        h.monitor.flush().await;

        let stored = h.events.query(&EventFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored
            .iter()
            .any(|e| e.event_type == EventType::MaliciousActivity && e.severity == Severity::High));
        assert_eq!(h.monitor.metrics().snapshot().dropped_events, 2);
    }

    #[tokio::test]
    async fn test_info_events_capped_per_minute() {
        let mut config = MonitoringConfig::default();
        config.max_events_per_minute = 2;
        let h = harness(config);
        for _ in 0..4 {
            h.monitor
                .log_event(event(EventType::NetworkActivity, Severity::Info, "192.0.2.1"));
        }
        h.monitor
            .log_event(event(EventType::MaliciousActivity, Severity::Medium, "192.0.2.1"));
        h.monitor.flush().await;

        let stored = h.events.query(&EventFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(h.monitor.metrics().snapshot().total_events, 5);
    }

    #[tokio::test]
    async fn test_failed_login_threshold_raises_one_alert() {
        let mut config = MonitoringConfig::default();
        config.alert_thresholds.failed_login_attempts = 3;
        config.enable_threat_intelligence = false;
        let h = harness(config);

        for _ in 0..4 {
            h.monitor
                .log_event(event(EventType::Authentication, Severity::Medium, "203.0.113.5"));
        }
        h.monitor.flush().await;

        let active = h.alerts.get_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type, AlertType::ThresholdExceeded);
        assert_eq!(active[0].metadata["ip_address"], "203.0.113.5");
    }

    #[tokio::test]
    async fn test_suspicious_ip_threshold_flags_reputation() {
        let mut config = MonitoringConfig::default();
        config.alert_thresholds.suspicious_ip_requests = 2;
        config.enable_threat_intelligence = false;
        let h = harness(config);

        for _ in 0..2 {
            h.monitor
                .log_event(event(EventType::MaliciousActivity, Severity::Medium, "198.51.100.7"));
        }
        h.monitor.flush().await;

        assert!(h.reputation.is_flagged("198.51.100.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_critical_event_raises_system_compromise() {
        let mut config = MonitoringConfig::default();
        config.enable_threat_intelligence = false;
        let h = harness(config);
        h.monitor
            .log_event(event(EventType::PrivilegeEscalation, Severity::Critical, "192.0.2.9"));
        h.monitor.flush().await;

        let alerts = h.alerts.list(&AlertFilter::default()).await.unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == AlertType::SystemCompromise));
    }

    #[tokio::test]
    async fn test_high_threat_counts_detection_once_per_window() {
        let h = harness(MonitoringConfig::default());
        for _ in 0..3 {
            h.monitor
                .log_event(event(EventType::MaliciousActivity, Severity::High, "192.0.2.44"));
        }
        h.monitor.flush().await;

        assert_eq!(h.monitor.metrics().snapshot().threat_detections, 3);
        let threat_alerts: Vec<_> = h
            .alerts
            .list(&AlertFilter::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.alert_type == AlertType::ThreatDetected)
            .collect();
        assert_eq!(threat_alerts.len(), 1);
    }

    struct FlakySink {
        failures_left: AtomicU32,
        created: AtomicU32,
    }

    #[async_trait]
    impl AlertSink for FlakySink {
        async fn create(&self, _alert: &SecurityAlert) -> GatewayResult<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::Store {
                    message: "unavailable".into(),
                });
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn update(&self, id: &str, _: AlertUpdate) -> GatewayResult<SecurityAlert> {
            Err(GatewayError::not_found(id))
        }
        async fn resolve(&self, id: &str, _: &str) -> GatewayResult<SecurityAlert> {
            Err(GatewayError::not_found(id))
        }
        async fn get(&self, _: &str) -> GatewayResult<Option<SecurityAlert>> {
            Ok(None)
        }
        async fn get_active(&self) -> GatewayResult<Vec<SecurityAlert>> {
            Ok(Vec::new())
        }
        async fn list(&self, _: &AlertFilter) -> GatewayResult<Vec<SecurityAlert>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_alert_creation_is_retried() {
        let mut config = MonitoringConfig::default();
        config.enable_threat_intelligence = false;
        config.alert_retry_limit = 3;
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(1),
            created: AtomicU32::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(SecurityMetrics::new());
        let monitor = SecurityMonitor::start(
            config.clone(),
            Arc::new(KvEventStore::new(store, config.retention_period)),
            sink.clone(),
            metrics,
            Arc::new(HeuristicThreatDetector::new(Duration::from_secs(60))),
            Arc::new(IpReputation::new()),
        );

        monitor.log_event(event(EventType::SystemAccess, Severity::Critical, "192.0.2.1"));
        monitor.flush().await;
        assert_eq!(sink.created.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        monitor.flush().await;
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let h = harness(MonitoringConfig::default());
        for _ in 0..10 {
            h.monitor
                .log_event(event(EventType::MaliciousActivity, Severity::Medium, "192.0.2.1"));
        }
        h.monitor.shutdown().await;

        let stored = h.events.query(&EventFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 10);
    }
}
