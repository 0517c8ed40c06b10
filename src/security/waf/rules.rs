//! WAF rule definitions and the compiled rule arena.
//!
//! Rules live in a flat `Vec` in declaration order; an id-to-index map gives
//! lookups, and each rule's `enabled` flag is an atomic so toggling a rule never
//! touches the rest of the set.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

use crate::core::config::WafRuleConfig;
use crate::core::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    LdapInjection,
    XmlInjection,
    Ssrf,
    FileUpload,
    UserAgent,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Block,
    Challenge,
    Log,
}

fn definition(
    id: &str,
    name: &str,
    rule_type: RuleType,
    pattern: &str,
    action: RuleAction,
    severity: Severity,
    score: u32,
) -> WafRuleConfig {
    WafRuleConfig {
        id: id.to_string(),
        name: name.to_string(),
        rule_type,
        pattern: pattern.to_string(),
        action,
        severity,
        score,
        enabled: true,
    }
}

/// Rule set provisioned at startup, before any configured rules
pub fn default_rules() -> Vec<WafRuleConfig> {
    vec![
        definition(
            "sql_001",
            "SQL Injection - Union Select",
            RuleType::SqlInjection,
            r"(?i)union\s+(all\s+)?select",
            RuleAction::Block,
            Severity::High,
            80,
        ),
        definition(
            "sql_002",
            "SQL Injection - Comment or Tautology",
            RuleType::SqlInjection,
            r#"(?i)('|%27)\s*(--|#|/\*)|'\s*(or|and)\s+'?\d+'?\s*=\s*'?\d+|\bor\s+1\s*=\s*1\b"#,
            RuleAction::Block,
            Severity::High,
            70,
        ),
        definition(
            "xss_001",
            "XSS - Script Tag",
            RuleType::Xss,
            r"(?i)<script[^>]*>",
            RuleAction::Block,
            Severity::High,
            80,
        ),
        definition(
            "xss_002",
            "XSS - Event Handler",
            RuleType::Xss,
            r"(?i)\bon(error|load|click|dblclick|mouseover|mouseout|mouseenter|focus|blur|change|submit|keydown|keyup|keypress|unload)\s*=",
            RuleAction::Block,
            Severity::Medium,
            60,
        ),
        definition(
            "path_001",
            "Path Traversal",
            RuleType::PathTraversal,
            r"(?i)(\.\./|\.\.\\|%2e%2e%2f|%2e%2e/|\.\.%2f|%2e%2e%5c|\.\.%5c)",
            RuleAction::Block,
            Severity::High,
            80,
        ),
        definition(
            "cmd_001",
            "Command Injection",
            RuleType::CommandInjection,
            r"(?i)(;|\|\||&&|\||`|\$\()\s*(cat|ls|id|whoami|uname|nc|netcat|bash|sh|zsh|powershell|cmd|rm|chmod|ping|nslookup|perl|php)\b(\s|$|[;|&<>`)])",
            RuleAction::Block,
            Severity::High,
            80,
        ),
        definition(
            "ua_001",
            "Offensive Tool User Agent",
            RuleType::UserAgent,
            r"(?i)(sqlmap|nikto|nmap|masscan|zgrab|acunetix|nessus|openvas|dirbuster|gobuster|wpscan|burp)",
            RuleAction::Block,
            Severity::High,
            90,
        ),
        definition(
            "sql_003",
            "SQL Keywords",
            RuleType::SqlInjection,
            r"(?i)\b(select\s+\S.*\s+from|insert\s+into|drop\s+table|delete\s+from)\b",
            RuleAction::Log,
            Severity::Low,
            10,
        ),
        definition(
            "ssrf_001",
            "SSRF - Metadata or Local Scheme",
            RuleType::Ssrf,
            r"(?i)(169\.254\.169\.254|metadata\.google\.internal|file://|gopher://|dict://)",
            RuleAction::Log,
            Severity::Low,
            20,
        ),
        definition(
            "ldap_001",
            "LDAP Filter Injection",
            RuleType::LdapInjection,
            r"\)\s*\(\s*[|&!]",
            RuleAction::Log,
            Severity::Low,
            10,
        ),
        definition(
            "xml_001",
            "XML External Entity",
            RuleType::XmlInjection,
            r"(?i)(<!ENTITY|<!DOCTYPE[^>]*\[)",
            RuleAction::Log,
            Severity::Low,
            20,
        ),
    ]
}

/// A rule in the arena. `pattern` is `None` when compilation failed; such a
/// rule stays disabled.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub rule_type: RuleType,
    pub source: String,
    pub pattern: Option<Regex>,
    pub action: RuleAction,
    pub severity: Severity,
    pub score: u32,
    enabled: AtomicBool,
}

impl CompiledRule {
    fn compile(definition: &WafRuleConfig, disabled: bool) -> Self {
        let pattern = match Regex::new(&definition.pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                error!(
                    rule_id = %definition.id,
                    pattern = %definition.pattern,
                    error = %e,
                    "Failed to compile WAF rule, rule disabled"
                );
                None
            }
        };
        let enabled = definition.enabled && !disabled && pattern.is_some();

        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            rule_type: definition.rule_type,
            source: definition.pattern.clone(),
            pattern,
            action: definition.action,
            severity: definition.severity,
            score: definition.score,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.pattern
            .as_ref()
            .map_or(false, |pattern| pattern.is_match(haystack))
    }
}

/// Flat rule arena with an id index
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    index: HashMap<String, usize>,
}

impl RuleSet {
    /// Compile definitions in order. A later definition with an existing id
    /// replaces the earlier one in place.
    pub fn compile(definitions: &[WafRuleConfig], disabled_ids: &[String]) -> Self {
        let mut set = RuleSet::default();
        for definition in definitions {
            let disabled = disabled_ids.iter().any(|id| id == &definition.id);
            let rule = CompiledRule::compile(definition, disabled);
            match set.index.get(&rule.id) {
                Some(&position) => set.rules[position] = rule,
                None => {
                    set.index.insert(rule.id.clone(), set.rules.len());
                    set.rules.push(rule);
                }
            }
        }

        info!(
            total = set.rules.len(),
            enabled = set.enabled().count(),
            "WAF rule set compiled"
        );
        set
    }

    /// Built-in rules followed by the configured ones
    pub fn with_defaults(extra: &[WafRuleConfig], disabled_ids: &[String]) -> Self {
        let mut definitions = default_rules();
        definitions.extend_from_slice(extra);
        Self::compile(&definitions, disabled_ids)
    }

    pub fn get(&self, id: &str) -> Option<&CompiledRule> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    /// Flip a rule's flag. Rules without a compiled pattern cannot be enabled.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.get(id) {
            Some(rule) if !enabled || rule.pattern.is_some() => {
                rule.enabled.store(enabled, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|rule| rule.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_compile() {
        let set = RuleSet::with_defaults(&[], &[]);
        assert_eq!(set.len(), default_rules().len());
        assert_eq!(set.enabled().count(), set.len());
        assert!(set.get("sql_001").unwrap().is_match("1 UNION SELECT 1"));
        assert!(set.get("cmd_001").unwrap().is_match("?host=x; cat /etc/passwd"));
        assert!(!set.get("cmd_001").unwrap().is_match("session=abc; id=42"));
        assert!(!set
            .get("cmd_001")
            .unwrap()
            .is_match("Mozilla/5.0 (X11; Linux x86_64)"));
    }

    #[test]
    fn test_bad_pattern_disables_rule() {
        let mut broken = default_rules().remove(0);
        broken.id = "custom_broken".into();
        broken.pattern = "(unclosed".into();
        let set = RuleSet::with_defaults(&[broken], &[]);

        let rule = set.get("custom_broken").unwrap();
        assert!(rule.pattern.is_none());
        assert!(!rule.is_enabled());
        assert!(!set.set_enabled("custom_broken", true));
    }

    #[test]
    fn test_disable_by_config_and_toggle() {
        let set = RuleSet::with_defaults(&[], &["xss_002".to_string()]);
        assert!(!set.get("xss_002").unwrap().is_enabled());
        assert!(set.set_enabled("xss_002", true));
        assert!(set.get("xss_002").unwrap().is_enabled());
        assert!(!set.set_enabled("missing", true));
    }

    #[test]
    fn test_compilation_is_idempotent() {
        let a = RuleSet::with_defaults(&[], &[]);
        let b = RuleSet::with_defaults(&[], &[]);
        let inputs = [
            "/api/v1/users?id=1 UNION SELECT 1",
            "<script>alert(1)</script>",
            "../../etc/passwd",
            "plain text",
        ];
        for (ra, rb) in a.enabled().zip(b.enabled()) {
            assert_eq!(ra.id, rb.id);
            assert_eq!(
                ra.pattern.as_ref().map(Regex::as_str),
                rb.pattern.as_ref().map(Regex::as_str)
            );
            for input in inputs {
                assert_eq!(ra.is_match(input), rb.is_match(input));
            }
        }
    }
}
