//! Wire types for capability tokens.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-scope restriction attached to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScopeConstraint {
    /// Resource glob patterns the scope is restricted to. `None` means
    /// unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    /// Earliest instant the scope may be exercised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Latest instant the scope may be exercised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    /// Maximum number of uses. Carried as metadata; not enforced by
    /// `check_permission` (see design notes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u64>,
}

/// An immutable, signed capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Opaque identifier of the holder, unique within an issuer.
    pub agent_id: String,
    /// Identifier of the token that delegated this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Scope patterns the holder may request.
    pub scopes: Vec<String>,
    /// Per-scope-pattern restrictions.
    pub constraints: BTreeMap<String, ScopeConstraint>,
    /// Whether child tokens may be derived from this one.
    pub delegatable: bool,
    /// Maximum allowed delegation chain length.
    pub max_delegation_depth: u32,
    /// This token's position in its delegation chain (0 for root).
    pub current_depth: u32,
    /// Absolute expiry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Upper bound on `expires_at` for any refresh of this token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_expires_at: Option<DateTime<Utc>>,
    /// `base64url(HMAC-SHA256(key, canonical_json(token_without_signature)))`.
    pub signature: String,
}
