//! Security observability: structured logging, security events and their
//! store, alerts, threat analysis, metrics and the monitor that ties them
//! together.

pub mod alerts;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod threat;

pub use alerts::{AlertFilter, AlertSink, AlertStatus, AlertType, AlertUpdate, KvAlertManager, SecurityAlert};
pub use events::{EventFilter, EventStore, KvEventStore, SecurityEvent};
pub use logging::{init_tracing, DataSanitizer};
pub use metrics::{SecurityMetrics, SecurityMetricsSnapshot};
pub use monitor::SecurityMonitor;
pub use threat::{HeuristicThreatDetector, ThreatAnalysis, ThreatDetector};
