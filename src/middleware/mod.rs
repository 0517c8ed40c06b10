pub mod rate_limiting;

pub use rate_limiting::{
    MultiCheckResult, RateLimitDecision, RateLimitError, RateLimitKeyGenerator, RateLimiter,
    RateLimitMetricsSnapshot,
};
