//! # Security Gateway
//!
//! A security layer in front of backend services. Every request passes through
//! the same pipeline before it is proxied upstream:
//!
//! 1. payload size check
//! 2. multi-scope rate limiting (ip, user, endpoint, global)
//! 3. web application firewall (IP lists, geo policy, bot detection, rules)
//! 4. input validation of URL, headers and body
//! 5. authentication and authorization
//!
//! Decisions are recorded as security events in a shared key-value store,
//! where a background monitor correlates them into alerts.
//!
//! ## Modules
//! - [`core`]: configuration, errors, the request envelope and per-request scope
//! - [`store`]: the key-value capability (Redis or in-memory)
//! - [`middleware`]: the rate limiter
//! - [`security`]: WAF and input validator
//! - [`auth`]: the auth gate and its collaborators
//! - [`observability`]: logging, metrics, events, alerts and the monitor
//! - [`gateway`]: HTTP server, management API and upstream proxy

pub mod auth;
pub mod core;
pub mod gateway;
pub mod middleware;
pub mod observability;
pub mod security;
pub mod store;

pub use core::config::{ConfigManager, GatewayConfig};
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayBuilder};
