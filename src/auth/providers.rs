//! # Authentication Providers
//!
//! Collaborator interfaces for credential verification and authorization, plus
//! the placeholder implementations used until a deployment plugs in a real
//! token format.

use async_trait::async_trait;
use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, GatewayResult};

/// Who the caller is, as established by a [`CredentialVerifier`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Turns the `Authorization` header value into an identity or a denial.
///
/// Token parsing, signature verification and revocation lookups belong in
/// implementations of this trait.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> GatewayResult<Identity>;
}

/// Decides whether an authenticated identity may invoke an endpoint
#[async_trait]
pub trait PolicyDecisionPoint: Send + Sync {
    async fn authorize(&self, identity: &Identity, method: &Method, path: &str) -> GatewayResult<bool>;
}

/// Accepts any credential of at least `min_length` characters.
///
/// The identity it returns carries no user id, so no per-user budget applies.
#[derive(Debug, Clone)]
pub struct PlaceholderVerifier {
    min_length: usize,
}

impl PlaceholderVerifier {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

#[async_trait]
impl CredentialVerifier for PlaceholderVerifier {
    async fn verify(&self, credential: &str) -> GatewayResult<Identity> {
        if credential.trim().chars().count() < self.min_length {
            return Err(GatewayError::auth("invalid authorization credential"));
        }
        Ok(Identity::default())
    }
}

/// Allows every authenticated identity
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAuthenticated;

#[async_trait]
impl PolicyDecisionPoint for AllowAuthenticated {
    async fn authorize(&self, _identity: &Identity, _method: &Method, _path: &str) -> GatewayResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_placeholder_length_rule() {
        let verifier = PlaceholderVerifier::new(10);
        assert!(verifier.verify("Bearer abc").await.is_ok());
        assert!(matches!(
            verifier.verify("Bearer").await,
            Err(GatewayError::Authentication { .. })
        ));
        assert!(verifier.verify("Bearer abc").await.unwrap().user_id.is_none());
    }
}
