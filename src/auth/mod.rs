//! # Auth Gate
//!
//! Authentication and authorization stages of the pipeline. Both are skipped
//! for public endpoints (exact path match) and when auth is disabled.
//! Credential checks are delegated to a [`CredentialVerifier`], endpoint access
//! to a [`PolicyDecisionPoint`].

pub mod providers;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::AuthConfig;
use crate::core::error::GatewayError;
use crate::core::types::{BlockReason, DenialKind, SecurityRequest};

pub use providers::{
    AllowAuthenticated, CredentialVerifier, Identity, PlaceholderVerifier, PolicyDecisionPoint,
};

pub struct AuthGate {
    config: AuthConfig,
    verifier: Arc<dyn CredentialVerifier>,
    policy: Arc<dyn PolicyDecisionPoint>,
}

impl AuthGate {
    pub fn new(
        config: &AuthConfig,
        verifier: Arc<dyn CredentialVerifier>,
        policy: Arc<dyn PolicyDecisionPoint>,
    ) -> Self {
        Self {
            config: config.clone(),
            verifier,
            policy,
        }
    }

    /// Gate with the placeholder verifier and the allow-all policy
    pub fn placeholder(config: &AuthConfig) -> Self {
        Self::new(
            config,
            Arc::new(PlaceholderVerifier::new(config.min_token_length)),
            Arc::new(AllowAuthenticated),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.config.public_endpoints.iter().any(|endpoint| endpoint == path)
    }

    /// Whether the auth stages run for this request
    pub fn applies_to(&self, request: &SecurityRequest) -> bool {
        self.config.enabled && !self.is_public(&request.path)
    }

    pub async fn authenticate(&self, request: &SecurityRequest) -> Result<Identity, BlockReason> {
        let credential = match request.header("authorization") {
            Some(value) if !value.trim().is_empty() => value,
            _ => {
                return Err(BlockReason::new(
                    DenialKind::Unauthenticated,
                    "missing authorization header",
                ))
            }
        };

        match self.verifier.verify(credential).await {
            Ok(identity) => {
                debug!(request_id = %request.id, user_id = ?identity.user_id, "Request authenticated");
                Ok(identity)
            }
            Err(GatewayError::Authentication { reason }) => {
                Err(BlockReason::new(DenialKind::Unauthenticated, reason))
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Credential verifier failed");
                Err(BlockReason::new(DenialKind::Internal, "authentication unavailable"))
            }
        }
    }

    pub async fn authorize(
        &self,
        identity: &Identity,
        request: &SecurityRequest,
    ) -> Result<(), BlockReason> {
        match self
            .policy
            .authorize(identity, &request.method, &request.path)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(BlockReason::new(DenialKind::Forbidden, "access denied")),
            Err(GatewayError::Authorization { reason }) => {
                Err(BlockReason::new(DenialKind::Forbidden, reason))
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Policy decision point failed");
                Err(BlockReason::new(DenialKind::Internal, "authorization unavailable"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use bytes::Bytes;
    use crate::core::error::GatewayResult;

    struct AdminOnly;

    #[async_trait]
    impl PolicyDecisionPoint for AdminOnly {
        async fn authorize(&self, identity: &Identity, _: &Method, path: &str) -> GatewayResult<bool> {
            Ok(!path.starts_with("/admin") || identity.roles.iter().any(|r| r == "admin"))
        }
    }

    fn request(path: &str, authorization: Option<&'static str>) -> SecurityRequest {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert("authorization", HeaderValue::from_static(value));
        }
        SecurityRequest::from_transport(Method::GET, path, &headers, Bytes::new(), "192.0.2.1:1", 64)
    }

    #[test]
    fn test_public_endpoints_match_exactly() {
        let gate = AuthGate::placeholder(&AuthConfig::default());
        assert!(!gate.applies_to(&request("/health", None)));
        assert!(gate.applies_to(&request("/health/deep", None)));
        assert!(!gate.applies_to(&request("/api/v1/auth/login?next=/", None)));
    }

    #[tokio::test]
    async fn test_authentication_outcomes() {
        let gate = AuthGate::placeholder(&AuthConfig::default());

        let missing = gate.authenticate(&request("/orders", None)).await.unwrap_err();
        assert_eq!(missing.kind, DenialKind::Unauthenticated);

        let short = gate
            .authenticate(&request("/orders", Some("Bearer x")))
            .await
            .unwrap_err();
        assert_eq!(short.kind, DenialKind::Unauthenticated);

        assert!(gate
            .authenticate(&request("/orders", Some("Bearer valid-token")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_policy_denial_is_forbidden() {
        let gate = AuthGate::new(
            &AuthConfig::default(),
            Arc::new(PlaceholderVerifier::new(10)),
            Arc::new(AdminOnly),
        );
        let req = request("/admin/users", Some("Bearer valid-token"));
        let identity = gate.authenticate(&req).await.unwrap();
        let denied = gate.authorize(&identity, &req).await.unwrap_err();
        assert_eq!(denied.kind, DenialKind::Forbidden);
    }
}
