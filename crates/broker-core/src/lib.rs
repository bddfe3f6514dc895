#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The broker facade: composes the token engine, credential cache, provider
//! registry, signing key store, revocation set, and config store behind a
//! single `Broker` type, converting every leaf crate's focused error type
//! into the unified [`BrokerError`] at this seam.

use std::path::PathBuf;
use std::sync::Mutex;

use broker_cache::{CacheStats, CredentialCache};
use broker_config::{ConfigStore, ConfigStoreError, ConfigWarning, ProviderConfigStore};
use broker_error::{BrokerError, BrokerErrorCode};
use broker_keys::{KeyStore, KeyStoreError, SigningKey};
use broker_provider::{IssuedCredential, ProviderError, ProviderRegistry};
use broker_revocation::{RevocationError, RevocationSet, RevokeParams};
use broker_token::{DelegationRequest, RootTokenBuilder, Token, TokenError};
use tracing::warn;

const SIGNING_KEYS_FILE: &str = "signing_keys.json";
const REVOCATIONS_FILE: &str = "revocations.json";

/// Composes the broker's owned subsystems behind a single entry point.
pub struct Broker {
    keys: Mutex<KeyStore>,
    revocations: Mutex<RevocationSet>,
    cache: Mutex<CredentialCache>,
    providers: ProviderRegistry,
    config: ConfigStore,
}

impl Broker {
    /// Open (creating if absent) a broker rooted at `config_dir`, with the
    /// given provider registry.
    pub fn open(
        config_dir: impl Into<PathBuf>,
        providers: ProviderRegistry,
    ) -> Result<Self, BrokerError> {
        let config_dir = config_dir.into();
        let keys = KeyStore::open(config_dir.join(SIGNING_KEYS_FILE)).map_err(classify_keys)?;
        let revocations =
            RevocationSet::open(config_dir.join(REVOCATIONS_FILE)).map_err(classify_revocation)?;
        let config = ConfigStore::open(&config_dir).map_err(classify_config)?;
        Ok(Self {
            keys: Mutex::new(keys),
            revocations: Mutex::new(revocations),
            cache: Mutex::new(CredentialCache::new()),
            providers,
            config,
        })
    }

    /// The current signing key version, creating version 1 on first access.
    pub fn current_key_version(&self) -> Result<u32, BrokerError> {
        let mut keys = self.keys.lock().expect("keys lock poisoned");
        let (_, version) = keys.get_current().map_err(classify_keys)?;
        Ok(version)
    }

    /// Rotate the signing key, returning the new version.
    pub fn rotate_key(&self) -> Result<u32, BrokerError> {
        let mut keys = self.keys.lock().expect("keys lock poisoned");
        let (_, version) = keys.rotate().map_err(classify_keys)?;
        Ok(version)
    }

    /// Base64-encode the signing key at `version`, for shipping to a
    /// follower that is behind.
    pub fn export_key(&self, version: u32) -> Option<String> {
        self.keys.lock().expect("keys lock poisoned").export(version)
    }

    /// Import a signing key received from a leader during follower sync.
    pub fn import_key(&self, key_base64: &str, version: u32) -> Result<(), BrokerError> {
        self.keys
            .lock()
            .expect("keys lock poisoned")
            .import(key_base64, version)
            .map_err(classify_keys)
    }

    /// Whether at least one signing key is retained, without generating one
    /// on first access. Used by a follower to tell "no key synced yet" apart
    /// from "key at version 1".
    pub fn has_signing_key(&self) -> bool {
        self.keys.lock().expect("keys lock poisoned").has_any_key()
    }

    /// The current signing key version without generating one; `0` if no
    /// key has been synced or created yet.
    pub fn known_key_version(&self) -> u32 {
        self.keys
            .lock()
            .expect("keys lock poisoned")
            .current_version_no_create()
    }

    /// Build and sign a root token.
    pub fn create_root(
        &self,
        agent_id: impl Into<String>,
        configure: impl FnOnce(RootTokenBuilder) -> RootTokenBuilder,
    ) -> Result<Token, BrokerError> {
        let mut keys = self.keys.lock().expect("keys lock poisoned");
        let (key, _) = keys.get_current().map_err(classify_keys)?;
        let builder = configure(RootTokenBuilder::new(agent_id));
        builder.build(&key.key).map_err(classify_token)
    }

    /// Delegate a child token from `parent`, re-signing with whichever
    /// retained key version verifies `parent`.
    pub fn delegate(&self, parent: &Token, request: &DelegationRequest) -> Result<Token, BrokerError> {
        let key = self.verifying_key(parent)?;
        broker_token::delegate(parent, request, &key.key).map_err(classify_token)
    }

    /// Refresh `token`'s expiry, re-signing with the key that verifies it.
    pub fn refresh(
        &self,
        token: &Token,
        new_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Token, BrokerError> {
        let key = self.verifying_key(token)?;
        broker_token::refresh(token, new_expires_at, &key.key).map_err(classify_token)
    }

    /// Verify `token`, check it is not revoked, and check it permits `scope`
    /// against `resource`. Any failure is reported as `PermissionDenied`,
    /// wrapping the specific underlying code.
    pub fn check_permission(&self, token: &Token, scope: &str, resource: &str) -> Result<(), BrokerError> {
        if self.is_revoked(token)? {
            warn!(
                target: "broker.core",
                agent_id = %token.agent_id,
                scope,
                resource,
                "permission denied: token is revoked"
            );
            return Err(BrokerError::new(BrokerErrorCode::PermissionDenied, "token is revoked")
                .with_context("agent_id", &token.agent_id));
        }
        let key = self.verifying_key(token)?;
        broker_token::check_permission(token, scope, resource, &key.key)
            .map_err(classify_token)
            .map_err(|inner| wrap_permission_denied(scope, resource, inner))
            .inspect_err(|err| {
                warn!(
                    target: "broker.core",
                    agent_id = %token.agent_id,
                    scope,
                    resource,
                    code = ?err.code(),
                    "permission denied"
                );
            })
    }

    /// Issue a credential for `scope` scoped to `resource`. Checks
    /// permission, consults the cache, and dispatches to the provider
    /// registry on a miss. Only credentials with an `expires_at` are cached.
    pub async fn get_credential(
        &self,
        token: &Token,
        scope: &str,
        resource: &str,
    ) -> Result<IssuedCredential, BrokerError> {
        self.check_permission(token, scope, resource)?;

        if let Some(cached) = self
            .cache
            .lock()
            .expect("cache lock poisoned")
            .get(scope, resource)
        {
            return Ok(cached.clone());
        }

        let issued = self
            .providers
            .dispatch(scope, resource)
            .await
            .map_err(classify_provider)?;

        if issued.expires_at.is_some() {
            self.cache
                .lock()
                .expect("cache lock poisoned")
                .put(scope, resource, issued.clone());
        }
        Ok(issued)
    }

    /// Whether `token`'s identity (its `agent_id`) is currently revoked.
    pub fn is_revoked(&self, token: &Token) -> Result<bool, BrokerError> {
        self.revocations
            .lock()
            .expect("revocations lock poisoned")
            .is_revoked(&token.agent_id)
            .map_err(classify_revocation)
    }

    /// Revoke an identity.
    pub fn revoke(&self, params: RevokeParams) -> Result<(), BrokerError> {
        self.revocations
            .lock()
            .expect("revocations lock poisoned")
            .revoke(params)
            .map_err(classify_revocation)
    }

    /// Un-revoke an identity. Returns `true` if one existed.
    pub fn unrevoke(&self, token_id: &str) -> Result<bool, BrokerError> {
        self.revocations
            .lock()
            .expect("revocations lock poisoned")
            .unrevoke(token_id)
            .map_err(classify_revocation)
    }

    /// The revocation set's current version.
    pub fn revocation_version(&self) -> u64 {
        self.revocations.lock().expect("revocations lock poisoned").version()
    }

    /// The number of currently tracked revocation entries.
    pub fn revocation_count(&self) -> usize {
        self.revocations.lock().expect("revocations lock poisoned").len()
    }

    /// Revoked identifiers added since `version`.
    pub fn revocations_since(&self, version: u64) -> Vec<String> {
        self.revocations
            .lock()
            .expect("revocations lock poisoned")
            .revocations_since(version)
    }

    /// Apply a revocation delta received from a leader during follower sync.
    pub fn apply_revocation_delta(
        &self,
        token_ids: &[String],
        new_version: u64,
    ) -> Result<(), BrokerError> {
        self.revocations
            .lock()
            .expect("revocations lock poisoned")
            .apply_delta(token_ids, new_version)
            .map_err(classify_revocation)
    }

    /// Clear the credential cache.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    /// Remove cache entries already within the safety buffer of expiry.
    pub fn evict_expired_cache(&self) -> usize {
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .evict_expired()
    }

    /// Current cache size and per-key expiries.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().expect("cache lock poisoned").stats()
    }

    /// Load the provider configuration, with advisory warnings.
    pub fn load_config(&self) -> Result<(ProviderConfigStore, Vec<ConfigWarning>), BrokerError> {
        self.config.load().map_err(classify_config)
    }

    /// Persist the provider configuration.
    pub fn save_config(&self, config: &ProviderConfigStore) -> Result<(), BrokerError> {
        self.config.save(config).map_err(classify_config)
    }

    /// Load the provider configuration together with its version counter.
    pub fn load_config_versioned(&self) -> Result<(ProviderConfigStore, u64), BrokerError> {
        self.config.load_versioned().map_err(classify_config)
    }

    /// The provider configuration's current version, `0` if never saved.
    pub fn config_version(&self) -> Result<u64, BrokerError> {
        self.config.version().map_err(classify_config)
    }

    /// Persist a provider-config snapshot received from a leader at an
    /// explicit version, as used by a follower applying a sync response.
    pub fn apply_config_snapshot(
        &self,
        config: &ProviderConfigStore,
        version: u64,
    ) -> Result<(), BrokerError> {
        self.config.save_versioned(config, version).map_err(classify_config)
    }

    /// A redacted view of `config` safe to log or display.
    pub fn redacted_config(config: &ProviderConfigStore) -> serde_json::Value {
        ConfigStore::redacted_view(config)
    }

    /// Find the retained signing key version that verifies `token`.
    fn verifying_key(&self, token: &Token) -> Result<SigningKey, BrokerError> {
        let mut keys = self.keys.lock().expect("keys lock poisoned");
        keys.get_current().map_err(classify_keys)?;
        keys.all()
            .find(|k| broker_token::verify(token, &k.key).is_ok())
            .cloned()
            .ok_or_else(|| {
                warn!(
                    target: "broker.core",
                    agent_id = %token.agent_id,
                    "signature verification failed: no retained key verifies this token"
                );
                BrokerError::new(BrokerErrorCode::InvalidSignature, "no retained key verifies this token")
                    .with_context("agent_id", &token.agent_id)
            })
    }
}

fn wrap_permission_denied(scope: &str, resource: &str, inner: BrokerError) -> BrokerError {
    BrokerError::new(
        BrokerErrorCode::PermissionDenied,
        format!("permission denied: {}", inner.message()),
    )
    .with_context("scope", scope)
    .with_context("resource", resource)
    .with_source(inner)
}

fn classify_token(err: TokenError) -> BrokerError {
    match err {
        TokenError::InvalidSignature => {
            BrokerError::new(BrokerErrorCode::InvalidSignature, err.to_string())
        }
        TokenError::TokenExpired => BrokerError::new(BrokerErrorCode::TokenExpired, err.to_string()),
        TokenError::NotDelegatable => {
            BrokerError::new(BrokerErrorCode::NotDelegatable, err.to_string())
        }
        TokenError::DepthExceeded => {
            BrokerError::new(BrokerErrorCode::DepthExceeded, err.to_string())
        }
        TokenError::ScopeNotAllowed(ref scope) => {
            BrokerError::new(BrokerErrorCode::ScopeNotAllowed, err.to_string())
                .with_context("scope", scope)
        }
        TokenError::ResourceNotAllowed { ref scope, ref resource } => {
            BrokerError::new(BrokerErrorCode::ResourceNotAllowed, err.to_string())
                .with_context("scope", scope)
                .with_context("resource", resource)
        }
        TokenError::AtMaxLifetime => {
            BrokerError::new(BrokerErrorCode::AtMaxLifetime, err.to_string())
        }
        TokenError::RefreshNotPermitted => {
            BrokerError::new(BrokerErrorCode::PermissionDenied, err.to_string())
        }
        TokenError::Serde(_) | TokenError::Base64(_) | TokenError::Utf8(_) | TokenError::InvalidKey => {
            BrokerError::new(BrokerErrorCode::InvalidSignature, err.to_string())
        }
    }
}

fn classify_provider(err: ProviderError) -> BrokerError {
    match err {
        ProviderError::NotSupported(ref name) => {
            BrokerError::new(BrokerErrorCode::ProviderUnavailable, err.to_string())
                .with_context("provider", name)
        }
        ProviderError::Upstream(_) => {
            BrokerError::new(BrokerErrorCode::ProviderUpstream, err.to_string())
        }
        ProviderError::MalformedScope(ref scope) => {
            BrokerError::new(BrokerErrorCode::ScopeNotAllowed, err.to_string())
                .with_context("scope", scope)
        }
    }
}

fn classify_keys(err: KeyStoreError) -> BrokerError {
    BrokerError::new(BrokerErrorCode::Persistence, err.to_string())
}

fn classify_revocation(err: RevocationError) -> BrokerError {
    BrokerError::new(BrokerErrorCode::Persistence, err.to_string())
}

fn classify_config(err: ConfigStoreError) -> BrokerError {
    BrokerError::new(BrokerErrorCode::Persistence, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_provider::{Credential, Provider};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn issue_credential(
            &self,
            _scope: &str,
            _resource: &str,
        ) -> Result<IssuedCredential, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedCredential {
                credential: Credential::BearerToken {
                    token: "tok".to_string(),
                },
                expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            })
        }
    }

    fn broker_with_provider(dir: &std::path::Path, calls: Arc<AtomicUsize>) -> Broker {
        let mut providers = ProviderRegistry::new();
        providers.register("mock", Arc::new(CountingProvider { calls }));
        Broker::open(dir, providers).unwrap()
    }

    #[test]
    fn create_root_and_verify_permission() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_with_provider(dir.path(), Arc::new(AtomicUsize::new(0)));
        let token = broker
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();
        assert!(broker.check_permission(&token, "mock:op:read", "r").is_ok());
        assert!(broker.check_permission(&token, "mock:op:write", "r").is_err());
    }

    #[test]
    fn delegate_narrows_scope_and_resigns() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_with_provider(dir.path(), Arc::new(AtomicUsize::new(0)));
        let root = broker
            .create_root("agent-a", |b| b.scope("mock:op:read").scope("mock:op:write").ttl_days(1))
            .unwrap();
        let request = DelegationRequest {
            scopes: vec!["mock:op:read".to_string()],
            ..Default::default()
        };
        let child = broker.delegate(&root, &request).unwrap();
        assert!(broker.check_permission(&child, "mock:op:read", "r").is_ok());
        assert!(broker.check_permission(&child, "mock:op:write", "r").is_err());
    }

    #[test]
    fn revoked_identity_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_with_provider(dir.path(), Arc::new(AtomicUsize::new(0)));
        let token = broker
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();
        broker
            .revoke(RevokeParams {
                token_id: "agent-a".to_string(),
                ..Default::default()
            })
            .unwrap();
        let err = broker
            .check_permission(&token, "mock:op:read", "r")
            .unwrap_err();
        assert_eq!(err.code(), BrokerErrorCode::PermissionDenied);
    }

    #[test]
    fn key_rotation_does_not_invalidate_existing_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_with_provider(dir.path(), Arc::new(AtomicUsize::new(0)));
        let token = broker
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();
        broker.rotate_key().unwrap();
        assert!(broker.check_permission(&token, "mock:op:read", "r").is_ok());
    }

    #[tokio::test]
    async fn get_credential_caches_and_skips_second_provider_call() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker_with_provider(dir.path(), calls.clone());
        let token = broker
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();

        let first = broker.get_credential(&token, "mock:op:read", "r").await.unwrap();
        let second = broker.get_credential(&token, "mock:op:read", "r").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn export_and_import_key_round_trips_to_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let leader = broker_with_provider(dir.path(), Arc::new(AtomicUsize::new(0)));
        let version = leader.current_key_version().unwrap();
        let exported = leader.export_key(version).unwrap();

        let follower_dir = tempfile::tempdir().unwrap();
        let follower = broker_with_provider(follower_dir.path(), Arc::new(AtomicUsize::new(0)));
        follower.import_key(&exported, version).unwrap();
        assert_eq!(follower.export_key(version).unwrap(), exported);
    }

    #[test]
    fn revocation_delta_round_trips_between_leader_and_follower() {
        let leader_dir = tempfile::tempdir().unwrap();
        let leader = broker_with_provider(leader_dir.path(), Arc::new(AtomicUsize::new(0)));
        leader
            .revoke(RevokeParams {
                token_id: "agent-a".to_string(),
                ..Default::default()
            })
            .unwrap();
        let version = leader.revocation_version();
        let delta = leader.revocations_since(0);

        let follower_dir = tempfile::tempdir().unwrap();
        let follower = broker_with_provider(follower_dir.path(), Arc::new(AtomicUsize::new(0)));
        follower.apply_revocation_delta(&delta, version).unwrap();
        let token = follower
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();
        assert!(follower.is_revoked(&token).unwrap());
    }

    #[tokio::test]
    async fn get_credential_denies_without_scope() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_with_provider(dir.path(), Arc::new(AtomicUsize::new(0)));
        let token = broker
            .create_root("agent-a", |b| b.scope("mock:op:read").ttl_days(1))
            .unwrap();
        let err = broker
            .get_credential(&token, "mock:op:write", "r")
            .await
            .unwrap_err();
        assert_eq!(err.code(), BrokerErrorCode::PermissionDenied);
    }
}
