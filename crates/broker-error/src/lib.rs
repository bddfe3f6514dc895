#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Unified error taxonomy shared across the credential broker.
//!
//! Leaf crates define their own focused `thiserror` enums; the broker facade
//! and HTTP layers convert those into [`BrokerError`] at the seam, the way the
//! rest of this codebase funnels crate-local errors into one stable,
//! serializable shape at its public boundary.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Broad grouping of [`BrokerErrorCode`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BrokerErrorCategory {
    /// Token signature / authenticity failures.
    Signing,
    /// Expiry and refresh lifetime failures.
    Lifecycle,
    /// Delegation-time attenuation failures.
    Delegation,
    /// Permission-check failures at request time.
    Permission,
    /// Upstream provider failures.
    Provider,
    /// Leader/follower replication failures.
    Replication,
    /// On-disk persistence failures.
    Storage,
}

impl fmt::Display for BrokerErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Signing => "signing",
            Self::Lifecycle => "lifecycle",
            Self::Delegation => "delegation",
            Self::Permission => "permission",
            Self::Provider => "provider",
            Self::Replication => "replication",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Stable, machine-readable error code. Names are conceptual, not tied to any
/// particular internal representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerErrorCode {
    /// HMAC mismatch on verification.
    InvalidSignature,
    /// `now > expires_at`.
    TokenExpired,
    /// Parent token forbids further delegation.
    NotDelegatable,
    /// Delegation chain bound exceeded.
    DepthExceeded,
    /// Requested scope not covered by the token.
    ScopeNotAllowed,
    /// Constraint rejects the requested resource.
    ResourceNotAllowed,
    /// Wraps any gated-operation failure at the broker facade.
    PermissionDenied,
    /// Provider not configured or not supported.
    ProviderUnavailable,
    /// Upstream issuance failed.
    ProviderUpstream,
    /// Network/auth/timeout during follower sync.
    SyncFailed,
    /// Refresh requested past `max_expires_at`.
    AtMaxLifetime,
    /// File I/O failure during persistence.
    Persistence,
}

/// All known codes, used to guard against a silently dropped variant.
pub const ALL_CODES: &[BrokerErrorCode] = &[
    BrokerErrorCode::InvalidSignature,
    BrokerErrorCode::TokenExpired,
    BrokerErrorCode::NotDelegatable,
    BrokerErrorCode::DepthExceeded,
    BrokerErrorCode::ScopeNotAllowed,
    BrokerErrorCode::ResourceNotAllowed,
    BrokerErrorCode::PermissionDenied,
    BrokerErrorCode::ProviderUnavailable,
    BrokerErrorCode::ProviderUpstream,
    BrokerErrorCode::SyncFailed,
    BrokerErrorCode::AtMaxLifetime,
    BrokerErrorCode::Persistence,
];

impl BrokerErrorCode {
    /// The category this code belongs to.
    pub fn category(self) -> BrokerErrorCategory {
        match self {
            Self::InvalidSignature => BrokerErrorCategory::Signing,
            Self::TokenExpired | Self::AtMaxLifetime => BrokerErrorCategory::Lifecycle,
            Self::NotDelegatable | Self::DepthExceeded | Self::ScopeNotAllowed => {
                BrokerErrorCategory::Delegation
            }
            Self::PermissionDenied | Self::ResourceNotAllowed => BrokerErrorCategory::Permission,
            Self::ProviderUnavailable | Self::ProviderUpstream => BrokerErrorCategory::Provider,
            Self::SyncFailed => BrokerErrorCategory::Replication,
            Self::Persistence => BrokerErrorCategory::Storage,
        }
    }

    /// The `SCREAMING_SNAKE_CASE` wire form of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::NotDelegatable => "NOT_DELEGATABLE",
            Self::DepthExceeded => "DEPTH_EXCEEDED",
            Self::ScopeNotAllowed => "SCOPE_NOT_ALLOWED",
            Self::ResourceNotAllowed => "RESOURCE_NOT_ALLOWED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::ProviderUpstream => "PROVIDER_UPSTREAM",
            Self::SyncFailed => "SYNC_FAILED",
            Self::AtMaxLifetime => "AT_MAX_LIFETIME",
            Self::Persistence => "PERSISTENCE",
        }
    }
}

impl fmt::Display for BrokerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broker-facing error: a stable code, a human message, optional structured
/// context, and an optional source error.
pub struct BrokerError {
    code: BrokerErrorCode,
    message: String,
    context: BTreeMap<String, serde_json::Value>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl BrokerError {
    /// Construct a new error with the given code and message.
    pub fn new(code: BrokerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach a structured context value. Silently skipped if it cannot be
    /// serialized (should not happen for the plain scalars this is used for).
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach a source error.
    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The error's stable code.
    pub fn code(&self) -> BrokerErrorCode {
        self.code
    }

    /// The code's category, for convenience.
    pub fn category(&self) -> BrokerErrorCategory {
        self.code.category()
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The structured context attached to this error.
    pub fn context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.context
    }
}

impl fmt::Debug for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .finish()
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for BrokerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Serializable form of [`BrokerError`]. The opaque `source` is flattened into
/// a plain message since `dyn Error` is not serializable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BrokerErrorDto {
    /// Stable machine-readable code.
    pub code: BrokerErrorCode,
    /// Category the code belongs to.
    pub category: BrokerErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Structured context, if any.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Flattened `Display` of the source error, if any.
    pub source_message: Option<String>,
}

impl From<&BrokerError> for BrokerErrorDto {
    fn from(err: &BrokerError) -> Self {
        Self {
            code: err.code,
            category: err.category(),
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|e| e.to_string()),
        }
    }
}
