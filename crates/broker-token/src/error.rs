//! Token-engine specific error type.

use thiserror::Error;

/// Failure modes of the token engine.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Recomputed HMAC did not match the token's signature.
    #[error("invalid signature")]
    InvalidSignature,
    /// `now > expires_at`.
    #[error("token expired")]
    TokenExpired,
    /// Parent token has `delegatable == false`.
    #[error("parent token is not delegatable")]
    NotDelegatable,
    /// Parent has reached `max_delegation_depth`.
    #[error("delegation depth exceeded")]
    DepthExceeded,
    /// A requested scope is not covered by the parent/token's scopes.
    #[error("scope not allowed by token: {0}")]
    ScopeNotAllowed(String),
    /// A requested resource is rejected by the effective constraint.
    #[error("resource not allowed: scope={scope} resource={resource}")]
    ResourceNotAllowed {
        /// The scope the constraint applies to.
        scope: String,
        /// The rejected resource identifier.
        resource: String,
    },
    /// `now` has already reached `max_expires_at`.
    #[error("token has reached its maximum lifetime")]
    AtMaxLifetime,
    /// `refresh` was requested without holding a refresh scope.
    #[error("permission denied: missing system:token:refresh")]
    RefreshNotPermitted,
    /// JSON (de)serialization failure.
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    /// Base64 decode failure during `deserialize`.
    #[error("invalid base64 token encoding: {0}")]
    Base64(#[from] base64::DecodeError),
    /// UTF-8 decode failure during `deserialize`.
    #[error("invalid utf-8 in decoded token: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// Signing key has the wrong length for HMAC-SHA256 (any length works in
    /// practice, but a zero-length key is rejected).
    #[error("invalid signing key")]
    InvalidKey,
}
