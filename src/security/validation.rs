//! # Input Validation and Sanitization
//!
//! Per-kind validators (email, password, URL, IP, generic input, file type)
//! returning a [`ValidationResult`] that carries errors, warnings, an optional
//! sanitized value and the highest threat level detected.
//!
//! Generic input is scanned with three pattern families:
//! - SQL injection (threat `critical`)
//! - cross-site scripting (threat `high`)
//! - path traversal (threat `high`)

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::error;
use url::Url;

use crate::core::config::ValidationConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ThreatLevel;
use crate::security::waf::ip_list::is_private_or_loopback;

const MAX_EMAIL_LEN: usize = 254;
const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$";

const SUSPICIOUS_EMAIL_PARTS: &[&str] = &[
    "admin", "root", "test", "guest", "anonymous", "null", "undefined", "eval", "exec",
];

const WEAK_PASSWORDS: &[&str] = &["password", "123456", "qwerty", "admin", "letmein"];

const SQL_INJECTION_PATTERNS: &[&str] = &[
    r"(?i)\bunion\s+(all\s+)?select\b",
    r"(?i);\s*(drop|delete|truncate|alter|insert|update|exec)\b",
    r"(?i)'\s*(or|and)\s+'?\w+'?\s*=\s*'?\w+",
    r"(?i)'\s*(--|#|/\*)",
];

const XSS_PATTERNS: &[&str] = &[
    r"(?i)<\s*script",
    r"(?i)javascript\s*:",
    r"(?i)<\s*iframe",
    r"(?i)<\s*object",
    r"(?i)<\s*embed",
    r"(?i)\bon(error|load)\s*=",
];

const PATH_TRAVERSAL_PATTERNS: &[&str] = &[
    r"\.\./",
    r"\.\.\\",
    r"(?i)%2e%2e%2f",
    r"(?i)%2e%2e%5c",
    r"(?i)\.\.%2f",
    r"(?i)\.\.%5c",
];

/// Validation kinds accepted by [`InputValidator::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationKind {
    Email,
    Password,
    Url,
    Ip,
    Input,
    File,
}

impl FromStr for ValidationKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(ValidationKind::Email),
            "password" => Ok(ValidationKind::Password),
            "url" => Ok(ValidationKind::Url),
            "ip" => Ok(ValidationKind::Ip),
            "input" => Ok(ValidationKind::Input),
            "file" => Ok(ValidationKind::File),
            other => Err(GatewayError::validation(
                "type",
                format!("unsupported validation type '{}'", other),
            )),
        }
    }
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub sanitized_value: Option<String>,
    pub threat_level: ThreatLevel,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            sanitized_value: None,
            threat_level: ThreatLevel::None,
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    fn threat(&mut self, message: impl Into<String>, level: ThreatLevel) {
        self.error(message);
        self.threat_level = self.threat_level.max(level);
    }

    fn warn(&mut self, message: impl Into<String>, level: ThreatLevel) {
        self.warnings.push(message.into());
        self.threat_level = self.threat_level.max(level);
    }

    /// First error, for denial messages
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

/// Compile built-in patterns; a pattern that fails is logged and skipped
fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            Regex::new(p)
                .map_err(|e| error!(pattern = %p, error = %e, "Invalid validation pattern"))
                .ok()
        })
        .collect()
}

/// HTML-escape the characters that matter for markup injection
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

/// Input validator and sanitizer
pub struct InputValidator {
    config: ValidationConfig,
    email: Option<Regex>,
    sql_injection: Vec<Regex>,
    xss: Vec<Regex>,
    path_traversal: Vec<Regex>,
    blocked: Vec<Regex>,
}

impl InputValidator {
    pub fn new(config: &ValidationConfig) -> GatewayResult<Self> {
        let blocked = config
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    GatewayError::config(format!("Invalid blocked pattern '{}': {}", p, e))
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            config: config.clone(),
            email: compile_patterns(&[EMAIL_PATTERN]).into_iter().next(),
            sql_injection: compile_patterns(SQL_INJECTION_PATTERNS),
            xss: compile_patterns(XSS_PATTERNS),
            path_traversal: compile_patterns(PATH_TRAVERSAL_PATTERNS),
            blocked,
        })
    }

    pub fn validate(&self, kind: ValidationKind, value: &str) -> ValidationResult {
        match kind {
            ValidationKind::Email => self.validate_email(value),
            ValidationKind::Password => self.validate_password(value),
            ValidationKind::Url => self.validate_url(value),
            ValidationKind::Ip => self.validate_ip(value),
            ValidationKind::Input => self.validate_input(value),
            ValidationKind::File => self.validate_file_type(value),
        }
    }

    fn sanitize(&self, result: &mut ValidationResult, value: &str) {
        if result.valid {
            result.sanitized_value = Some(if self.config.enable_sanitization {
                html_escape(value)
            } else {
                value.to_string()
            });
        }
    }

    pub fn validate_email(&self, value: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        let value = value.trim();

        if value.is_empty() {
            result.error("email is required");
            return result;
        }
        if value.len() > MAX_EMAIL_LEN {
            result.error("email is too long");
            return result;
        }
        if !self.email.as_ref().map_or(false, |re| re.is_match(value)) {
            result.error("invalid email format");
            return result;
        }

        let lower = value.to_ascii_lowercase();
        if SUSPICIOUS_EMAIL_PARTS.iter().any(|part| lower.contains(part)) {
            result.warn("email contains suspicious content", ThreatLevel::Medium);
        }

        self.sanitize(&mut result, value);
        result
    }

    pub fn validate_password(&self, value: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        let length = value.chars().count();

        if length < MIN_PASSWORD_LEN {
            result.error(format!("password must be at least {} characters", MIN_PASSWORD_LEN));
        }
        if length > MAX_PASSWORD_LEN {
            result.error(format!("password must be at most {} characters", MAX_PASSWORD_LEN));
        }
        if !value.chars().any(|c| c.is_uppercase()) {
            result.error("password must contain an uppercase letter");
        }
        if !value.chars().any(|c| c.is_lowercase()) {
            result.error("password must contain a lowercase letter");
        }
        if !value.chars().any(|c| c.is_ascii_digit()) {
            result.error("password must contain a digit");
        }
        if !value.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace()) {
            result.error("password must contain a symbol");
        }
        if WEAK_PASSWORDS.contains(&value.to_lowercase().as_str()) {
            result.threat("password is too common", ThreatLevel::High);
        }

        // never echo a password back
        result
    }

    pub fn validate_url(&self, value: &str) -> ValidationResult {
        let mut result = ValidationResult::new();

        let url = match Url::parse(value.trim()) {
            Ok(url) => url,
            Err(_) => {
                result.error("invalid URL format");
                return result;
            }
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            result.error("URL scheme must be http or https");
        }

        match url.host_str() {
            None => result.error("URL must have a host"),
            Some(host) => {
                let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
                if !self.config.allowed_domains.is_empty() && !self.domain_allowed(&host) {
                    result.error("domain not allowed");
                }
                if self.config.strict_mode {
                    let private = match host.parse::<IpAddr>() {
                        Ok(ip) => is_private_or_loopback(ip),
                        Err(_) => host == "localhost",
                    };
                    if private {
                        result.warn("URL points to a private or loopback address", ThreatLevel::Low);
                    }
                }
            }
        }

        self.sanitize(&mut result, value);
        result
    }

    fn domain_allowed(&self, host: &str) -> bool {
        self.config.allowed_domains.iter().any(|domain| {
            let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }

    pub fn validate_ip(&self, value: &str) -> ValidationResult {
        let mut result = ValidationResult::new();

        match value.trim().parse::<IpAddr>() {
            Ok(ip) => {
                if self.config.strict_mode && is_private_or_loopback(ip) {
                    result.warn("private or loopback address", ThreatLevel::Low);
                }
                result.sanitized_value = Some(ip.to_string());
            }
            Err(_) => result.error("invalid IP address"),
        }
        result
    }

    pub fn validate_input(&self, value: &str) -> ValidationResult {
        let mut result = ValidationResult::new();

        if value.len() > self.config.max_input_length {
            result.error(format!(
                "input exceeds maximum length of {} bytes",
                self.config.max_input_length
            ));
            return result;
        }

        if self.sql_injection.iter().any(|re| re.is_match(value)) {
            result.threat("potential SQL injection detected", ThreatLevel::Critical);
        }
        if self.xss.iter().any(|re| re.is_match(value)) {
            result.threat("potential XSS detected", ThreatLevel::High);
        }
        if self.path_traversal.iter().any(|re| re.is_match(value)) {
            result.threat("potential path traversal detected", ThreatLevel::High);
        }
        if self.blocked.iter().any(|re| re.is_match(value)) {
            result.threat("input matches a blocked pattern", ThreatLevel::Medium);
        }

        self.sanitize(&mut result, value);
        result
    }

    /// Extension check against `allowed_file_types`
    pub fn validate_file_type(&self, file_name: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        let name = file_name.trim();

        if name.is_empty() {
            result.error("file name is required");
            return result;
        }
        if self.path_traversal.iter().any(|re| re.is_match(name)) || name.contains('\0') {
            result.threat("potential path traversal detected", ThreatLevel::High);
            return result;
        }

        let extension = name
            .rfind('.')
            .map(|i| name[i..].to_ascii_lowercase())
            .unwrap_or_default();
        let allowed = self
            .config
            .allowed_file_types
            .iter()
            .any(|ext| ext.to_ascii_lowercase() == extension);
        if extension.is_empty() || !allowed {
            result.error("file type not allowed");
        }

        self.sanitize(&mut result, name);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> InputValidator {
        InputValidator::new(&ValidationConfig::default()).unwrap()
    }

    fn strict() -> InputValidator {
        InputValidator::new(&ValidationConfig {
            strict_mode: true,
            allowed_domains: vec!["example.com".into()],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_email() {
        let v = validator();
        let bad = v.validate_email("a@b");
        assert!(!bad.valid);
        assert_eq!(bad.errors, vec!["invalid email format".to_string()]);
        assert_eq!(bad.threat_level, ThreatLevel::None);

        let good = v.validate_email("jane.doe@example.com");
        assert!(good.valid);
        assert_eq!(good.sanitized_value.as_deref(), Some("jane.doe@example.com"));

        let odd = v.validate_email("root@example.com");
        assert!(odd.valid);
        assert_eq!(odd.warnings.len(), 1);
        assert_eq!(odd.threat_level, ThreatLevel::Medium);

        assert!(!v.validate_email(&format!("{}@example.com", "a".repeat(250))).valid);
    }

    #[test]
    fn test_password() {
        let v = validator();
        assert!(v.validate_password("Str0ng!pass").valid);
        assert!(v.validate_password("Str0ng!pass").sanitized_value.is_none());

        let short = v.validate_password("Ab1!");
        assert!(!short.valid);
        assert_eq!(short.threat_level, ThreatLevel::None);

        let weak = v.validate_password("password");
        assert!(!weak.valid);
        assert_eq!(weak.threat_level, ThreatLevel::High);
    }

    #[test]
    fn test_url() {
        let v = strict();
        assert!(v.validate_url("https://api.example.com/v1").valid);
        assert!(!v.validate_url("ftp://example.com/file").valid);
        assert_eq!(
            v.validate_url("https://evil.test/").errors,
            vec!["domain not allowed".to_string()]
        );
        assert!(!v.validate_url("not a url").valid);

        let open = validator();
        let local = open.validate_url("http://localhost/api");
        assert!(local.valid && local.warnings.is_empty());
        let local = InputValidator::new(&ValidationConfig {
            strict_mode: true,
            ..Default::default()
        })
        .unwrap()
        .validate_url("http://127.0.0.1/api");
        assert!(local.valid);
        assert_eq!(local.threat_level, ThreatLevel::Low);
    }

    #[test]
    fn test_ip() {
        assert!(!validator().validate_ip("999.1.1.1").valid);
        let private = strict().validate_ip("10.0.0.8");
        assert!(private.valid);
        assert_eq!(private.threat_level, ThreatLevel::Low);
        assert!(validator().validate_ip("10.0.0.8").warnings.is_empty());
    }

    #[test]
    fn test_generic_input_threat_families() {
        let v = validator();
        assert_eq!(
            v.validate_input("1 union select password from users").threat_level,
            ThreatLevel::Critical
        );
        assert_eq!(v.validate_input("<script>alert(1)</script>").threat_level, ThreatLevel::High);
        assert_eq!(v.validate_input("../../etc/passwd").threat_level, ThreatLevel::High);

        let clean = v.validate_input("Tom & Jerry <3");
        assert!(clean.valid);
        assert_eq!(
            clean.sanitized_value.as_deref(),
            Some("Tom &amp; Jerry &lt;3")
        );
    }

    #[test]
    fn test_common_headers_pass() {
        let v = validator();
        for value in [
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
            "Bearer eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig",
            "session=abc; theme=dark",
        ] {
            assert!(v.validate_input(value).valid, "{}", value);
        }
    }

    #[test]
    fn test_input_length_and_blocked_patterns() {
        let v = InputValidator::new(&ValidationConfig {
            max_input_length: 8,
            blocked_patterns: vec!["(?i)forbidden".into()],
            ..Default::default()
        })
        .unwrap();
        let long = v.validate_input("123456789");
        assert!(!long.valid);
        assert_eq!(long.threat_level, ThreatLevel::None);
        assert_eq!(v.validate_input("Forbidden").threat_level, ThreatLevel::None);

        let v = InputValidator::new(&ValidationConfig {
            blocked_patterns: vec!["(?i)forbidden".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(v.validate_input("Forbidden").threat_level, ThreatLevel::Medium);
    }

    #[test]
    fn test_file_type() {
        let v = validator();
        assert!(v.validate_file_type("report.PDF").valid);
        assert!(!v.validate_file_type("payload.exe").valid);
        assert!(!v.validate_file_type("README").valid);
        assert_eq!(
            v.validate_file_type("../../etc/passwd.txt").threat_level,
            ThreatLevel::High
        );
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("EMAIL".parse::<ValidationKind>().unwrap(), ValidationKind::Email);
        assert!("zip".parse::<ValidationKind>().is_err());
    }
}
