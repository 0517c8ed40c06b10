//! # Error Handling
//!
//! [`GatewayError`] is returned by configuration loading, the store-backed
//! event and alert services, collaborators and the management API. The request
//! pipeline never propagates it: stage failures become a blocking
//! [`Verdict`](crate::core::types::Verdict) with a typed denial.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Unreadable, unparsable or invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Credential missing or rejected by a [`CredentialVerifier`](crate::auth::CredentialVerifier)
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Refused by a [`PolicyDecisionPoint`](crate::auth::PolicyDecisionPoint)
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Unknown alert or event id
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Illegal alert state transition
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Shared key-value store unreachable or returned bad data
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration { .. } | Self::Serialization { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable `type` field of error bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Store { .. } => "store_error",
            Self::Serialization { .. } => "serialization_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// `{error, message, type}`, the same flat shape as pipeline denials
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.to_string(),
            "type": self.error_type(),
        });
        (status, Json(body)).into_response()
    }
}
