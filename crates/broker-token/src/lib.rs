#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Capability-token engine: creation, signing, hierarchical delegation with
//! attenuation, verification, permission checking, refresh, and
//! serialization.

mod builder;
mod engine;
mod error;
mod model;
mod signing;
mod wire;

pub use builder::RootTokenBuilder;
pub use engine::{check_permission, delegate, refresh, verify, DelegationRequest};
pub use error::TokenError;
pub use model::{ScopeConstraint, Token};
pub use signing::{canonicalize, compute_signature, verify_signature};
pub use wire::{deserialize, serialize};

#[cfg(test)]
mod scenario_tests {
    use std::collections::BTreeMap;

    use super::*;

    const KEY: &[u8] = b"scenario-signing-key";

    #[test]
    fn s1_root_verify_and_tamper() {
        let token = RootTokenBuilder::new("a")
            .scope("github:repo:read")
            .ttl_days(1)
            .build(KEY)
            .unwrap();
        assert!(verify(&token, KEY).is_ok());

        let mut tampered = token;
        tampered.scopes = vec!["github:*".to_string()];
        assert!(matches!(
            verify(&tampered, KEY),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn s2_chain_narrowing() {
        let mut constraints = BTreeMap::new();
        constraints.insert(
            "github:repo:*".to_string(),
            ScopeConstraint {
                resources: Some(vec!["myorg/*".to_string()]),
                not_before: None,
                not_after: None,
                max_uses: None,
            },
        );
        let root = RootTokenBuilder::new("root")
            .scopes(vec![
                "github:repo:read".to_string(),
                "github:repo:write".to_string(),
                "aws:s3:read".to_string(),
            ])
            .constraint(
                "github:repo:*",
                constraints.get("github:repo:*").cloned().unwrap(),
            )
            .max_delegation_depth(3)
            .build(KEY)
            .unwrap();

        let child1 = delegate(
            &root,
            &DelegationRequest {
                scopes: vec![
                    "github:repo:read".to_string(),
                    "github:repo:write".to_string(),
                ],
                ..Default::default()
            },
            KEY,
        )
        .unwrap();
        assert_eq!(child1.current_depth, 1);

        let mut grandchild_constraints = BTreeMap::new();
        grandchild_constraints.insert(
            "github:repo:read".to_string(),
            ScopeConstraint {
                resources: Some(vec!["myorg/docs".to_string(), "myorg/research".to_string()]),
                ..Default::default()
            },
        );
        let grandchild = delegate(
            &child1,
            &DelegationRequest {
                scopes: vec!["github:repo:read".to_string()],
                constraints: grandchild_constraints,
                ..Default::default()
            },
            KEY,
        )
        .unwrap();

        assert!(check_permission(&grandchild, "github:repo:read", "myorg/docs", KEY).is_ok());
        assert!(check_permission(&grandchild, "github:repo:read", "myorg/other", KEY).is_err());
        assert!(check_permission(&grandchild, "github:repo:write", "myorg/docs", KEY).is_err());
    }

    #[test]
    fn s3_expiry_capping() {
        let root = RootTokenBuilder::new("root")
            .scope("github:repo:read")
            .ttl_days(1)
            .build(KEY)
            .unwrap();

        let child = delegate(
            &root,
            &DelegationRequest {
                scopes: vec!["github:repo:read".to_string()],
                ttl_minutes: Some(7 * 24 * 60),
                ..Default::default()
            },
            KEY,
        )
        .unwrap();

        assert_eq!(child.expires_at, root.expires_at);
    }

    #[test]
    fn s4_non_delegatable() {
        let root = RootTokenBuilder::new("root")
            .scope("github:repo:read")
            .build(KEY)
            .unwrap();
        let child = delegate(
            &root,
            &DelegationRequest {
                scopes: vec!["github:repo:read".to_string()],
                delegatable: Some(false),
                ..Default::default()
            },
            KEY,
        )
        .unwrap();
        assert!(!child.delegatable);

        let err = delegate(
            &child,
            &DelegationRequest {
                scopes: vec!["github:repo:read".to_string()],
                ..Default::default()
            },
            KEY,
        )
        .unwrap_err();
        assert!(matches!(err, TokenError::NotDelegatable));
    }

    #[test]
    fn depth_bound_enforced() {
        let mut token = RootTokenBuilder::new("root")
            .scope("*")
            .max_delegation_depth(2)
            .build(KEY)
            .unwrap();

        for _ in 0..2 {
            token = delegate(
                &token,
                &DelegationRequest {
                    scopes: vec!["*".to_string()],
                    ..Default::default()
                },
                KEY,
            )
            .unwrap();
        }

        let err = delegate(
            &token,
            &DelegationRequest {
                scopes: vec!["*".to_string()],
                ..Default::default()
            },
            KEY,
        )
        .unwrap_err();
        assert!(matches!(err, TokenError::DepthExceeded));
    }

    #[test]
    fn delegatable_is_monotonically_non_increasing() {
        let root = RootTokenBuilder::new("root").scope("*").build(KEY).unwrap();
        let child = delegate(
            &root,
            &DelegationRequest {
                scopes: vec!["*".to_string()],
                delegatable: Some(false),
                ..Default::default()
            },
            KEY,
        )
        .unwrap();
        // A grandchild cannot re-enable delegation the parent disabled.
        let attempt = delegate(
            &child,
            &DelegationRequest {
                scopes: vec!["*".to_string()],
                delegatable: Some(true),
                ..Default::default()
            },
            KEY,
        );
        assert!(attempt.is_err());
    }

    #[test]
    fn refresh_requires_scope() {
        let root = RootTokenBuilder::new("root")
            .scope("github:repo:read")
            .ttl_days(1)
            .build(KEY)
            .unwrap();
        let err = refresh(&root, None, KEY).unwrap_err();
        assert!(matches!(err, TokenError::RefreshNotPermitted));

        let refreshable = RootTokenBuilder::new("root")
            .scope("system:token:refresh")
            .ttl_days(1)
            .build(KEY)
            .unwrap();
        let refreshed = refresh(&refreshable, None, KEY).unwrap();
        assert_eq!(refreshed.expires_at, refreshable.expires_at);
    }

    #[test]
    fn refresh_caps_at_max_expires_at() {
        let root = RootTokenBuilder::new("root")
            .scope("system:*")
            .ttl_days(1)
            .build(KEY)
            .unwrap();
        let far_future = chrono::Utc::now() + chrono::Duration::days(365);
        let refreshed = refresh(&root, Some(far_future), KEY).unwrap();
        assert_eq!(refreshed.expires_at, root.max_expires_at);
    }
}
