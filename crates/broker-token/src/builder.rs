//! Fluent builder for root tokens.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};

use crate::error::TokenError;
use crate::model::{ScopeConstraint, Token};
use crate::signing::compute_signature;

/// Builds and signs a root token (`parent_id = None`, `current_depth = 0`).
pub struct RootTokenBuilder {
    agent_id: String,
    scopes: Vec<String>,
    constraints: BTreeMap<String, ScopeConstraint>,
    delegatable: bool,
    max_delegation_depth: u32,
    ttl_days: Option<i64>,
}

impl RootTokenBuilder {
    /// Start building a root token for `agent_id`, with defaults:
    /// `delegatable = true`, `max_delegation_depth = 3`, no expiry.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            scopes: Vec::new(),
            constraints: BTreeMap::new(),
            delegatable: true,
            max_delegation_depth: 3,
            ttl_days: None,
        }
    }

    /// Add a single scope pattern.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Add every scope pattern in `scopes`.
    #[must_use]
    pub fn scopes(mut self, scopes: impl IntoIterator<Item = String>) -> Self {
        self.scopes.extend(scopes);
        self
    }

    /// Attach a constraint for a scope pattern already added via [`Self::scope`].
    #[must_use]
    pub fn constraint(mut self, scope: impl Into<String>, constraint: ScopeConstraint) -> Self {
        self.constraints.insert(scope.into(), constraint);
        self
    }

    /// Override `delegatable` (default `true`).
    #[must_use]
    pub fn delegatable(mut self, delegatable: bool) -> Self {
        self.delegatable = delegatable;
        self
    }

    /// Override `max_delegation_depth` (default `3`).
    #[must_use]
    pub fn max_delegation_depth(mut self, depth: u32) -> Self {
        self.max_delegation_depth = depth;
        self
    }

    /// Set a time-to-live in days; `expires_at` and `max_expires_at` are both
    /// set to `now + ttl_days * 86400s`.
    #[must_use]
    pub fn ttl_days(mut self, days: i64) -> Self {
        self.ttl_days = Some(days);
        self
    }

    /// Sign and return the root token. No persistence is performed.
    pub fn build(self, key: &[u8]) -> Result<Token, TokenError> {
        let expires_at = self.ttl_days.map(|days| Utc::now() + Duration::days(days));
        let mut token = Token {
            agent_id: self.agent_id,
            parent_id: None,
            scopes: self.scopes,
            constraints: self.constraints,
            delegatable: self.delegatable,
            max_delegation_depth: self.max_delegation_depth,
            current_depth: 0,
            expires_at,
            max_expires_at: expires_at,
            signature: String::new(),
        };
        token.signature = compute_signature(&token, key)?;
        Ok(token)
    }
}
