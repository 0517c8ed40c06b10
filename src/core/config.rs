//! # Configuration Module
//!
//! This module handles configuration management with hot reloading capabilities.
//! Every component receives its section explicitly through its constructor; there
//! is no process-wide configuration singleton.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde (every section has defaults)
//! - Environment variable override support (`GATEWAY_*`)
//! - Hot reloading using file system watchers, published on a broadcast channel
//! - Validation that collects every problem into one error message

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Severity;
use crate::security::waf::ip_list::IpMatcher;
use crate::security::waf::rules::{RuleAction, RuleType};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub rate_limit: RateLimitingConfig,
    pub waf: WafConfig,
    pub validation: ValidationConfig,
    /// Routing table: service name to upstream base URL
    pub services: HashMap<String, String>,
    pub auth: AuthConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

/// Listener and per-request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Overall per-request deadline; exceeding it yields 504
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Largest body captured; one byte more yields 413
    pub max_request_size: usize,
    /// In-flight request cap; saturation yields 503
    pub max_concurrent_requests: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            timeout: Duration::from_secs(30),
            max_request_size: 10 * 1024 * 1024,
            max_concurrent_requests: 1024,
            shutdown_grace_period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Shared key-value store used for rate-limit state, events and alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithmKind {
    #[default]
    SlidingWindow,
    TokenBucket,
}

/// Budget for one key scope (`ip`, `user`, `endpoint`, `global`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeLimit {
    pub requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Token-bucket capacity; defaults to `requests`
    #[serde(default)]
    pub burst: Option<u32>,
}

impl ScopeLimit {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self {
            requests,
            window,
            burst: None,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.burst.unwrap_or(self.requests).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub algorithm: RateLimitAlgorithmKind,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Allow requests when the store is unreachable
    pub fail_open: bool,
    pub limits: HashMap<String, ScopeLimit>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        let window = Duration::from_secs(60);
        let mut limits = HashMap::new();
        limits.insert("ip".to_string(), ScopeLimit::new(100, window));
        limits.insert("user".to_string(), ScopeLimit::new(1_000, window));
        limits.insert("endpoint".to_string(), ScopeLimit::new(5_000, window));
        limits.insert("global".to_string(), ScopeLimit::new(50_000, window));

        Self {
            enabled: true,
            algorithm: RateLimitAlgorithmKind::SlidingWindow,
            requests_per_minute: 100,
            burst_size: 20,
            window_size: window,
            cleanup_interval: Duration::from_secs(300),
            fail_open: true,
            limits,
        }
    }
}

impl RateLimitingConfig {
    /// Limit for a key scope, falling back to the global defaults
    pub fn limit_for(&self, scope: &str) -> ScopeLimit {
        if let Some(limit) = self.limits.get(scope) {
            return limit.clone();
        }

        let per_window =
            (self.requests_per_minute as f64 * self.window_size.as_secs_f64() / 60.0).ceil();
        ScopeLimit {
            requests: (per_window as u32).max(1),
            window: self.window_size,
            burst: Some(self.burst_size.max(1)),
        }
    }
}

/// Custom WAF rule declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafRuleConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub pattern: String,
    pub action: RuleAction,
    pub severity: Severity,
    #[serde(default)]
    pub score: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    pub enabled: bool,
    /// Deny IPs flagged by the monitor's suspicious-IP threshold
    pub block_suspicious_ip: bool,
    pub allowed_countries: Vec<String>,
    pub blocked_countries: Vec<String>,
    pub enable_geo_blocking: bool,
    pub enable_bot_detection: bool,
    /// Addresses or CIDR blocks
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    pub block_private_ips: bool,
    /// Rules appended to the built-in set
    pub rules: Vec<WafRuleConfig>,
    /// Built-in rule ids to disable
    pub disabled_rules: Vec<String>,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_suspicious_ip: false,
            allowed_countries: Vec::new(),
            blocked_countries: Vec::new(),
            enable_geo_blocking: false,
            enable_bot_detection: true,
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            block_private_ips: false,
            rules: Vec::new(),
            disabled_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_input_length: usize,
    pub allowed_file_types: Vec<String>,
    /// Extra regexes that reject generic input
    pub blocked_patterns: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub strict_mode: bool,
    pub enable_sanitization: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_input_length: 10 * 1024 * 1024,
            allowed_file_types: [".jpg", ".jpeg", ".png", ".gif", ".pdf", ".txt", ".csv", ".json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blocked_patterns: Vec::new(),
            allowed_domains: Vec::new(),
            strict_mode: false,
            enable_sanitization: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Paths that skip authentication and authorization
    pub public_endpoints: Vec<String>,
    /// Placeholder verifier: shortest acceptable `Authorization` value
    pub min_token_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            public_endpoints: vec![
                "/health".to_string(),
                "/metrics".to_string(),
                "/api/v1/security/health".to_string(),
                "/api/v1/security/metrics".to_string(),
                "/api/v1/security/validate".to_string(),
                "/api/v1/auth/login".to_string(),
                "/api/v1/auth/register".to_string(),
            ],
            min_token_length: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub failed_login_attempts: u32,
    pub suspicious_ip_requests: u32,
    pub high_risk_events: u32,
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    pub critical_event_threshold: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            failed_login_attempts: 5,
            suspicious_ip_requests: 100,
            high_risk_events: 10,
            time_window: Duration::from_secs(300),
            critical_event_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_real_time_monitoring: bool,
    #[serde(with = "humantime_serde")]
    pub retention_period: Duration,
    /// Persistence cap for info/low events
    pub max_events_per_minute: u32,
    pub enable_threat_intelligence: bool,
    pub alert_thresholds: AlertThresholds,
    /// Bounded queue between request tasks and the event writer
    pub event_queue_capacity: usize,
    /// Attempts for a failing alert creation before it is dropped
    pub alert_retry_limit: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_real_time_monitoring: true,
            retention_period: Duration::from_secs(720 * 3600),
            max_events_per_minute: 1000,
            enable_threat_intelligence: true,
            alert_thresholds: AlertThresholds::default(),
            event_queue_capacity: 10_000,
            alert_retry_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Load configuration from a YAML (`.yaml`/`.yml`) or JSON (`.json`) file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::parse(path, &content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> GatewayResult<Self> {
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
        }
    }

    /// Apply `GATEWAY_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("GATEWAY_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_PORT: {}", e)))?;
        }

        if let Some(timeout) = lookup("GATEWAY_TIMEOUT") {
            self.server.timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_TIMEOUT: {}", e)))?;
        }

        if let Some(size) = lookup("GATEWAY_MAX_REQUEST_SIZE") {
            self.server.max_request_size = size.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_MAX_REQUEST_SIZE: {}", e))
            })?;
        }

        if let Some(url) = lookup("GATEWAY_REDIS_URL") {
            self.store.redis_url = url;
            self.store.backend = StoreBackend::Redis;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.timeout.is_zero() {
            errors.push("server.timeout must be greater than 0".to_string());
        }
        if self.server.max_request_size == 0 {
            errors.push("server.max_request_size must be greater than 0".to_string());
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push("server.max_concurrent_requests must be greater than 0".to_string());
        }

        if self.store.backend == StoreBackend::Redis && Url::parse(&self.store.redis_url).is_err() {
            errors.push(format!("store.redis_url '{}' is not a valid URL", self.store.redis_url));
        }

        if self.rate_limit.window_size.is_zero() {
            errors.push("rate_limit.window_size must be greater than 0".to_string());
        }
        if self.rate_limit.cleanup_interval.is_zero() {
            errors.push("rate_limit.cleanup_interval must be greater than 0".to_string());
        }
        for (scope, limit) in &self.rate_limit.limits {
            if !["ip", "user", "endpoint", "global"].contains(&scope.as_str()) {
                errors.push(format!("rate_limit.limits has unknown scope '{}'", scope));
            }
            if limit.requests == 0 {
                errors.push(format!("rate_limit.limits.{}.requests must be greater than 0", scope));
            }
            if limit.window.is_zero() {
                errors.push(format!("rate_limit.limits.{}.window must be greater than 0", scope));
            }
        }

        for entry in self.waf.ip_whitelist.iter().chain(self.waf.ip_blacklist.iter()) {
            if IpMatcher::parse(entry).is_err() {
                errors.push(format!("waf ip list entry '{}' is not an address or CIDR block", entry));
            }
        }
        for country in self.waf.allowed_countries.iter().chain(self.waf.blocked_countries.iter()) {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                errors.push(format!("waf country code '{}' must be two letters", country));
            }
        }
        for rule in &self.waf.rules {
            if rule.id.is_empty() {
                errors.push("waf.rules entries need an id".to_string());
            }
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                errors.push(format!("waf rule '{}' pattern does not compile: {}", rule.id, e));
            }
        }

        if self.validation.max_input_length == 0 {
            errors.push("validation.max_input_length must be greater than 0".to_string());
        }
        for pattern in &self.validation.blocked_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("validation blocked pattern '{}' does not compile: {}", pattern, e));
            }
        }

        for (name, base) in &self.services {
            if name.is_empty() || name.contains('/') {
                errors.push(format!("service name '{}' must be a single path segment", name));
            }
            match Url::parse(base) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(format!(
                    "service '{}' uses unsupported scheme '{}'",
                    name,
                    url.scheme()
                )),
                Err(e) => errors.push(format!("service '{}' has invalid URL '{}': {}", name, base, e)),
            }
        }

        for endpoint in &self.auth.public_endpoints {
            if !endpoint.starts_with('/') {
                errors.push(format!("public endpoint '{}' must start with '/'", endpoint));
            }
        }

        if self.monitoring.retention_period.is_zero() {
            errors.push("monitoring.retention_period must be greater than 0".to_string());
        }
        if self.monitoring.alert_thresholds.time_window.is_zero() {
            errors.push("monitoring.alert_thresholds.time_window must be greater than 0".to_string());
        }
        if self.monitoring.event_queue_capacity == 0 {
            errors.push("monitoring.event_queue_capacity must be greater than 0".to_string());
        }

        if !["trace", "debug", "info", "warn", "error"]
            .contains(&self.logging.level.to_ascii_lowercase().as_str())
        {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}

/// Published on every successful reload
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub file_path: PathBuf,
    pub config: Arc<GatewayConfig>,
    pub timestamp: std::time::Instant,
}

/// Owns the current configuration and the file watcher that reloads it
pub struct ConfigManager {
    current_config: Arc<RwLock<Arc<GatewayConfig>>>,
    config_path: PathBuf,
    _watcher: Option<RecommendedWatcher>,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigManager {
    /// Load the file and start watching it for changes
    pub async fn new<P: AsRef<Path>>(config_path: P) -> GatewayResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = GatewayConfig::load_from_file(&config_path).await?;

        let (change_sender, _) = broadcast::channel(16);

        let mut manager = Self {
            current_config: Arc::new(RwLock::new(Arc::new(config))),
            config_path,
            _watcher: None,
            change_sender,
        };

        manager.setup_file_watcher()?;
        Ok(manager)
    }

    pub async fn current(&self) -> Arc<GatewayConfig> {
        Arc::clone(&*self.current_config.read().await)
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Force a reload, e.g. from a signal handler
    pub async fn reload_config(&self) -> GatewayResult<()> {
        tracing::info!(path = ?self.config_path, "Manually reloading configuration");
        let config = GatewayConfig::load_from_file(&self.config_path).await?;
        Self::publish(&self.current_config, &self.change_sender, &self.config_path, config).await;
        Ok(())
    }

    async fn publish(
        current: &RwLock<Arc<GatewayConfig>>,
        sender: &broadcast::Sender<ConfigChangeEvent>,
        path: &Path,
        config: GatewayConfig,
    ) {
        let config = Arc::new(config);
        *current.write().await = Arc::clone(&config);

        let event = ConfigChangeEvent {
            file_path: path.to_path_buf(),
            config,
            timestamp: std::time::Instant::now(),
        };
        if sender.send(event).is_err() {
            tracing::debug!("No configuration subscribers");
        }
        tracing::info!("Configuration updated successfully");
    }

    fn setup_file_watcher(&mut self) -> GatewayResult<()> {
        let config_path = self.config_path.clone();
        let current_config = Arc::clone(&self.current_config);
        let change_sender = self.change_sender.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        // Editors often replace the file via rename, so watch the directory
        let parent_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(parent_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;
        self._watcher = Some(watcher);

        let config_file_name = config_path
            .file_name()
            .ok_or_else(|| GatewayError::config("Invalid config file path"))?
            .to_owned();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let is_config_file_event = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(&config_file_name));
                if !is_config_file_event {
                    continue;
                }

                if let EventKind::Modify(_) | EventKind::Create(_) = event.kind {
                    tracing::info!("Configuration file changed, reloading...");
                    tokio::time::sleep(Duration::from_millis(100)).await;

                    match GatewayConfig::load_from_file(&config_path).await {
                        Ok(config) => {
                            Self::publish(&current_config, &change_sender, &config_path, config).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload configuration, keeping the running one");
                        }
                    }
                }
            }
        });

        tracing::info!("File watcher set up for configuration hot reloading");
        Ok(())
    }
}
