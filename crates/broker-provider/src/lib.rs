#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Credential payload types and the provider registry/dispatch layer.
//!
//! Mirrors this codebase's existing backend-dispatch shape: a small
//! `#[async_trait] trait X: Send + Sync` at the seam, and a name-keyed
//! registry of boxed trait objects populated at construction rather than a
//! hard-coded match over provider names.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A tagged credential payload. The discriminant (`credential_type`) is
/// carried by the enum variant itself rather than a separate field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "credential_type", rename_all = "snake_case")]
pub enum Credential {
    /// An opaque bearer token.
    BearerToken {
        /// The token value.
        token: String,
    },
    /// AWS-style temporary credentials.
    AwsCredentials {
        /// `AWS_ACCESS_KEY_ID`.
        access_key_id: String,
        /// `AWS_SECRET_ACCESS_KEY`.
        secret_access_key: String,
        /// `AWS_SESSION_TOKEN`, when the upstream issues one.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    /// A static API key.
    ApiKey {
        /// The key value.
        key: String,
    },
}

/// An issued credential together with its expiry, if the upstream provided
/// one. Credentials without an expiry are never cached (§4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    /// The credential payload.
    pub credential: Credential,
    /// Absolute expiry of the credential, if the upstream provided one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Failure modes of provider dispatch.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The scope's leading provider segment has no registered provider.
    #[error("provider not supported: {0}")]
    NotSupported(String),
    /// The upstream provider call itself failed.
    #[error("upstream provider failure: {0}")]
    Upstream(String),
    /// A scope had no colon-segment to use as a provider name.
    #[error("scope has no provider segment: {0}")]
    MalformedScope(String),
}

/// An upstream identity/credential system the broker wraps.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Issue a credential for `scope` scoped to `resource`.
    async fn issue_credential(
        &self,
        scope: &str,
        resource: &str,
    ) -> Result<IssuedCredential, ProviderError>;
}

/// Name-keyed registry of providers, populated at broker construction.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`. A later registration under the same
    /// name replaces the former.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Parse the leading colon-segment of `scope` as a provider name and
    /// dispatch `issue_credential` to it.
    pub async fn dispatch(
        &self,
        scope: &str,
        resource: &str,
    ) -> Result<IssuedCredential, ProviderError> {
        let name = provider_name(scope)?;
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| ProviderError::NotSupported(name.to_string()))?;
        provider.issue_credential(scope, resource).await
    }
}

/// Extract the leading colon-segment of a scope as a provider name.
pub fn provider_name(scope: &str) -> Result<&str, ProviderError> {
    scope
        .split_once(':')
        .map(|(name, _)| name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ProviderError::MalformedScope(scope.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysBearer;

    #[async_trait]
    impl Provider for AlwaysBearer {
        async fn issue_credential(
            &self,
            _scope: &str,
            _resource: &str,
        ) -> Result<IssuedCredential, ProviderError> {
            Ok(IssuedCredential {
                credential: Credential::BearerToken {
                    token: "tok".to_string(),
                },
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            })
        }
    }

    #[test]
    fn provider_name_extracts_leading_segment() {
        assert_eq!(provider_name("github:repo:read").unwrap(), "github");
        assert!(provider_name("noscope").is_err());
        assert!(provider_name(":repo:read").is_err());
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register("github", Arc::new(AlwaysBearer));

        let issued = registry
            .dispatch("github:repo:read", "myorg/docs")
            .await
            .unwrap();
        assert!(matches!(issued.credential, Credential::BearerToken { .. }));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_provider() {
        let registry = ProviderRegistry::new();
        let err = registry.dispatch("aws:s3:read", "bucket").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotSupported(name) if name == "aws"));
    }
}
