//! # Structured Logging
//!
//! Tracing subscriber setup (JSON or human-readable) and the sanitizer that
//! keeps credentials out of log lines and event metadata.

use regex::Regex;
use std::collections::BTreeMap;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::GatewayError;

const REDACTED: &str = "[REDACTED]";

/// Headers whose values never appear in logs
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return;
    }

    info!(level = %config.level, format = ?config.format, "Structured logging initialized");
}

/// Sensitive data sanitizer
pub struct DataSanitizer {
    sensitive_patterns: Vec<Regex>,
}

impl DataSanitizer {
    pub fn new(sensitive_fields: &[&str]) -> Result<Self, GatewayError> {
        let mut sources: Vec<String> = sensitive_fields
            .iter()
            .map(|field| format!(r#"(?i)"{}"\s*:\s*"[^"]*""#, regex::escape(field)))
            .collect();
        sources.push(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*".to_string());
        sources.push(r"(?i)basic\s+[A-Za-z0-9+/]+=*".to_string());
        sources.push(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b".to_string());

        let sensitive_patterns = sources
            .iter()
            .map(|source| {
                Regex::new(source).map_err(|e| {
                    GatewayError::internal(format!("Failed to compile redaction pattern: {}", e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { sensitive_patterns })
    }

    /// Sanitizer for the JSON fields that commonly carry secrets
    pub fn standard() -> Result<Self, GatewayError> {
        Self::new(&["password", "token", "secret", "api_key", "access_token", "refresh_token"])
    }

    pub fn sanitize(&self, data: &str) -> String {
        let mut sanitized = data.to_string();
        for pattern in &self.sensitive_patterns {
            sanitized = pattern.replace_all(&sanitized, REDACTED).into_owned();
        }
        sanitized
    }

    /// Header value as it may be logged
    pub fn sanitize_header(&self, name: &str, value: &str) -> String {
        if SENSITIVE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            REDACTED.to_string()
        } else {
            self.sanitize(value)
        }
    }

    pub fn sanitize_headers(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| (name.clone(), self.sanitize_header(name, value)))
            .collect()
    }
}
