//! Request inspection: the WAF engine and the input validator.

pub mod validation;
pub mod waf;

pub use validation::{InputValidator, ValidationKind, ValidationResult};
pub use waf::{GeoResolver, IpReputation, WafEngine, WafResult};
