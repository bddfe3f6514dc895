//! Verification, delegation, permission checks, and refresh.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use broker_match::scope_matches;

use crate::error::TokenError;
use crate::model::{ScopeConstraint, Token};
use crate::signing::{compute_signature, verify_signature};

/// Scopes that grant permission to call [`refresh`].
const REFRESH_SCOPES: [&str; 3] = ["system:token:refresh", "system:*", "*"];

/// A request to delegate a child token from a parent.
#[derive(Debug, Clone, Default)]
pub struct DelegationRequest {
    /// Explicit agent id for the child, or `None` to auto-generate one.
    pub agent_id: Option<String>,
    /// Scopes requested for the child. Each must be covered by a parent scope.
    pub scopes: Vec<String>,
    /// Per-scope constraint requested for the child; merged narrower-only
    /// with the parent's effective constraint for the same scope.
    pub constraints: BTreeMap<String, ScopeConstraint>,
    /// Requested delegatable flag; `None` defaults to `true`, then is ANDed
    /// with the parent's flag.
    pub delegatable: Option<bool>,
    /// Requested time-to-live in minutes; `None` defaults to the parent's
    /// `expires_at` unchanged.
    pub ttl_minutes: Option<i64>,
}

/// Verify `token`'s signature and expiry. Does not walk the delegation chain:
/// the signature over `current_depth`/`max_delegation_depth`/`scopes`/
/// `constraints`/`delegatable` already captures every attenuation decision
/// made at delegation time, under the assumption that only the engine itself
/// can produce a validly signed token.
pub fn verify(token: &Token, key: &[u8]) -> Result<(), TokenError> {
    if !verify_signature(token, key) {
        return Err(TokenError::InvalidSignature);
    }
    if let Some(expires_at) = token.expires_at {
        if expires_at < Utc::now() {
            return Err(TokenError::TokenExpired);
        }
    }
    Ok(())
}

/// Delegate a child token from `parent` per `request`.
pub fn delegate(parent: &Token, request: &DelegationRequest, key: &[u8]) -> Result<Token, TokenError> {
    verify(parent, key)?;

    if !parent.delegatable {
        return Err(TokenError::NotDelegatable);
    }
    if parent.current_depth >= parent.max_delegation_depth {
        return Err(TokenError::DepthExceeded);
    }
    for requested_scope in &request.scopes {
        if !parent
            .scopes
            .iter()
            .any(|parent_scope| scope_matches(parent_scope, requested_scope))
        {
            return Err(TokenError::ScopeNotAllowed(requested_scope.clone()));
        }
    }

    let mut constraints = BTreeMap::new();
    for scope in &request.scopes {
        let parent_constraint = effective_constraint(&parent.constraints, scope);
        let requested_constraint = request.constraints.get(scope);
        if let Some(merged) = merge_constraint(parent_constraint, requested_constraint) {
            constraints.insert(scope.clone(), merged);
        }
    }

    let delegatable = request.delegatable.unwrap_or(true) && parent.delegatable;

    let expires_at = match (request.ttl_minutes, parent.expires_at) {
        (Some(minutes), Some(parent_expiry)) => {
            Some((Utc::now() + Duration::minutes(minutes)).min(parent_expiry))
        }
        (Some(minutes), None) => Some(Utc::now() + Duration::minutes(minutes)),
        (None, parent_expiry) => parent_expiry,
    };

    let agent_id = request
        .agent_id
        .clone()
        .unwrap_or_else(generate_agent_id);

    let mut child = Token {
        agent_id,
        parent_id: Some(parent.agent_id.clone()),
        scopes: request.scopes.clone(),
        constraints,
        delegatable,
        max_delegation_depth: parent.max_delegation_depth,
        current_depth: parent.current_depth + 1,
        expires_at,
        max_expires_at: parent.max_expires_at,
        signature: String::new(),
    };
    child.signature = compute_signature(&child, key)?;
    Ok(child)
}

/// Verify `token` and check it permits `scope` against `resource`.
pub fn check_permission(
    token: &Token,
    scope: &str,
    resource: &str,
    key: &[u8],
) -> Result<(), TokenError> {
    verify(token, key)?;

    if !token
        .scopes
        .iter()
        .any(|pattern| scope_matches(pattern, scope))
    {
        return Err(TokenError::ScopeNotAllowed(scope.to_string()));
    }

    let now = Utc::now();
    if let Some(constraint) = effective_constraint(&token.constraints, scope) {
        if let Some(not_before) = constraint.not_before {
            if now < not_before {
                return Err(TokenError::ResourceNotAllowed {
                    scope: scope.to_string(),
                    resource: resource.to_string(),
                });
            }
        }
        if let Some(not_after) = constraint.not_after {
            if now > not_after {
                return Err(TokenError::ResourceNotAllowed {
                    scope: scope.to_string(),
                    resource: resource.to_string(),
                });
            }
        }
        if let Some(resources) = &constraint.resources {
            let allowed = resources
                .iter()
                .any(|pattern| broker_match::resource_matches(pattern, resource));
            if !allowed {
                return Err(TokenError::ResourceNotAllowed {
                    scope: scope.to_string(),
                    resource: resource.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Produce a refreshed token with a new `expires_at`, capped at
/// `max_expires_at`. Requires a refresh scope on `token`.
pub fn refresh(
    token: &Token,
    new_expires_at: Option<DateTime<Utc>>,
    key: &[u8],
) -> Result<Token, TokenError> {
    verify(token, key)?;

    if !token
        .scopes
        .iter()
        .any(|s| REFRESH_SCOPES.contains(&s.as_str()))
    {
        return Err(TokenError::RefreshNotPermitted);
    }

    if let Some(max_expires_at) = token.max_expires_at {
        if Utc::now() >= max_expires_at {
            return Err(TokenError::AtMaxLifetime);
        }
    }

    let capped = match (new_expires_at, token.max_expires_at) {
        (Some(requested), Some(max)) => Some(requested.min(max)),
        (Some(requested), None) => Some(requested),
        (None, max) => max,
    };

    let mut refreshed = token.clone();
    refreshed.expires_at = capped;
    refreshed.signature = compute_signature(&refreshed, key)?;
    Ok(refreshed)
}

/// Find the effective constraint for `scope`: exact key match first, else
/// the first entry whose key covers `scope` under the matcher relation.
fn effective_constraint<'a>(
    constraints: &'a BTreeMap<String, ScopeConstraint>,
    scope: &str,
) -> Option<&'a ScopeConstraint> {
    if let Some(exact) = constraints.get(scope) {
        return Some(exact);
    }
    constraints
        .iter()
        .find(|(pattern, _)| scope_matches(pattern, scope))
        .map(|(_, constraint)| constraint)
}

/// Merge a parent's effective constraint with a child's requested one; the
/// child may only narrow. `None` on both sides yields `None` (no constraint).
fn merge_constraint(
    parent: Option<&ScopeConstraint>,
    requested: Option<&ScopeConstraint>,
) -> Option<ScopeConstraint> {
    if parent.is_none() && requested.is_none() {
        return None;
    }
    let resources = match (parent, requested) {
        (_, Some(r)) if r.resources.is_some() => r.resources.clone(),
        (Some(p), _) => p.resources.clone(),
        _ => None,
    };
    let not_before = later(
        parent.and_then(|c| c.not_before),
        requested.and_then(|c| c.not_before),
    );
    let not_after = earlier(
        parent.and_then(|c| c.not_after),
        requested.and_then(|c| c.not_after),
    );
    let max_uses = match (
        parent.and_then(|c| c.max_uses),
        requested.and_then(|c| c.max_uses),
    ) {
        (Some(p), Some(r)) => Some(p.min(r)),
        (Some(p), None) => Some(p),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    };
    Some(ScopeConstraint {
        resources,
        not_before,
        not_after,
        max_uses,
    })
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn earlier(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn generate_agent_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("agent-{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
