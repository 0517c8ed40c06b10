//! User-agent based bot classification.

use serde::Serialize;

const SUSPICIOUS_MARKERS: &[&str] = &[
    "bot", "crawler", "spider", "scraper", "curl", "wget", "python", "java", "okhttp",
];

const LEGITIMATE_BOTS: &[&str] = &[
    "googlebot",
    "bingbot",
    "slurp",
    "duckduckbot",
    "baiduspider",
    "yandexbot",
    "facebookexternalhit",
    "twitterbot",
];

const MIN_USER_AGENT_LEN: usize = 10;
const MAX_USER_AGENT_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotDetection {
    pub is_bot: bool,
    /// In `[0, 1]`
    pub confidence: f64,
    pub reason: &'static str,
}

impl BotDetection {
    fn human() -> Self {
        Self {
            is_bot: false,
            confidence: 0.0,
            reason: "no bot indicators",
        }
    }

    fn suspicious(confidence: f64, reason: &'static str) -> Self {
        Self {
            is_bot: true,
            confidence,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BotDetector;

impl BotDetector {
    pub fn detect(&self, user_agent: Option<&str>) -> BotDetection {
        let user_agent = match user_agent.map(str::trim) {
            Some(ua) if !ua.is_empty() => ua,
            _ => return BotDetection::suspicious(0.8, "missing user agent"),
        };

        let lower = user_agent.to_ascii_lowercase();
        if LEGITIMATE_BOTS.iter().any(|bot| lower.contains(bot)) {
            return BotDetection {
                is_bot: true,
                confidence: 0.0,
                reason: "legitimate crawler",
            };
        }

        if SUSPICIOUS_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return BotDetection::suspicious(0.7, "automation user agent");
        }

        let len = user_agent.chars().count();
        if !(MIN_USER_AGENT_LEN..=MAX_USER_AGENT_LEN).contains(&len) {
            return BotDetection::suspicious(0.6, "unusual user agent length");
        }

        BotDetection::human()
    }
}
