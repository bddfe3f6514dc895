#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Mock credential provider for local development and tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use broker_provider::{Credential, IssuedCredential, Provider, ProviderError};

/// A provider that always succeeds, issuing a synthetic bearer token with a
/// fixed lifetime. Used in tests and local experimentation; never configured
/// as a real upstream identity system.
#[derive(Debug, Clone)]
pub struct MockProvider {
    ttl: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(1),
        }
    }
}

impl MockProvider {
    /// A mock provider issuing credentials with a custom lifetime.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn issue_credential(
        &self,
        scope: &str,
        resource: &str,
    ) -> Result<IssuedCredential, ProviderError> {
        Ok(IssuedCredential {
            credential: Credential::BearerToken {
                token: format!("mock-token:{scope}:{resource}"),
            },
            expires_at: Some(Utc::now() + self.ttl),
        })
    }
}
