#![cfg_attr(not(test), deny(unsafe_code))]
#![warn(missing_docs)]
//! On-disk signing secret and provider configuration.
//!
//! This crate follows the codebase's existing config-loading idiom — a
//! `schemars::JsonSchema`-derived shape, environment-variable overrides, and
//! advisory warnings returned alongside the loaded value rather than a hard
//! failure — extended with Unix file-mode enforcement and a redaction pass
//! over sensitive fields, neither of which the prior config loader needed.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const SECRET_FILE: &str = "token_secret";
const CONFIG_FILE: &str = "config.json";
const MAX_TTL_SECONDS: u64 = 86_400;
const LARGE_TTL_THRESHOLD: u64 = 3_600;
const REDACTED: &str = "***REDACTED***";

/// Failure modes of the config store.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// Underlying file I/O failed.
    #[error("config store I/O error: {0}")]
    Io(#[from] io::Error),
    /// The persisted config file was not valid JSON in the expected shape.
    #[error("config file is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level config issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A provider's TTL is unusually large.
    LargeTtl {
        /// Provider name.
        provider: String,
        /// TTL value in seconds.
        secs: u64,
    },
    /// A provider config key is deprecated.
    DeprecatedField {
        /// Provider name.
        provider: String,
        /// Name of the deprecated field.
        field: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeTtl { provider, secs } => {
                write!(f, "provider '{provider}' has an unusually large TTL ({secs}s)")
            }
            ConfigWarning::DeprecatedField { provider, field } => {
                write!(f, "provider '{provider}' uses deprecated field '{field}'")
            }
        }
    }
}

/// A single provider's configuration. `fields` carries provider-specific
/// settings (credentials, endpoints, etc.) that vary per provider type and
/// are not modeled as fixed struct fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProviderConfigEntry {
    /// The provider implementation this entry configures (e.g. `"github"`).
    pub provider_type: String,
    /// Default credential TTL in seconds, if the provider supports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    /// Remaining provider-specific fields.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// The full set of provider configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProviderConfigStore {
    /// Provider name to its configuration.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfigEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedConfig {
    #[serde(default)]
    version: u64,
    #[serde(flatten)]
    store: ProviderConfigStore,
}

/// Field names treated as sensitive and replaced wholesale on redaction.
const SENSITIVE_FIELDS: &[&str] = &["apiKey", "clientSecret", "refreshToken", "secretAccessKey"];

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_FIELDS.contains(&name)
        || name.ends_with("Key")
        || name.ends_with("Secret")
        || name.ends_with("Token")
}

fn is_path_field(name: &str) -> bool {
    name.ends_with("Path")
}

/// Owns the on-disk config directory: the signing secret and provider
/// configuration file.
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Open (creating if absent) the config directory at `dir`, mode 0700.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConfigStoreError> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    /// Return the standalone HMAC secret, generating and persisting 32
    /// random bytes on first access. Stable across restarts.
    pub fn get_or_create_secret(&self) -> Result<[u8; 32], ConfigStoreError> {
        let path = self.dir.join(SECRET_FILE);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let mut secret = [0u8; 32];
            if bytes.len() == 32 {
                secret.copy_from_slice(&bytes);
                return Ok(secret);
            }
        }
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        write_atomic(&path, &secret)?;
        Ok(secret)
    }

    /// Load the provider configuration, applying environment overrides and
    /// returning advisory warnings. A missing file loads as the default
    /// (empty) store.
    pub fn load(&self) -> Result<(ProviderConfigStore, Vec<ConfigWarning>), ConfigStoreError> {
        let (mut config, _) = self.load_versioned()?;
        apply_env_overrides(&mut config);
        let warnings = validate(&config)?;
        Ok((config, warnings))
    }

    /// Load the provider configuration together with its version counter.
    pub fn load_versioned(&self) -> Result<(ProviderConfigStore, u64), ConfigStoreError> {
        let path = self.dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok((ProviderConfigStore::default(), 0));
        }
        let content = fs::read_to_string(&path)?;
        let persisted: PersistedConfig = serde_json::from_str(&content)?;
        Ok((persisted.store, persisted.version))
    }

    /// The current provider-config version, `0` if never saved.
    pub fn version(&self) -> Result<u64, ConfigStoreError> {
        Ok(self.load_versioned()?.1)
    }

    /// Persist the provider configuration, mode 0600, incrementing the
    /// version counter.
    pub fn save(&self, config: &ProviderConfigStore) -> Result<(), ConfigStoreError> {
        let next_version = self.version()?.saturating_add(1);
        self.save_versioned(config, next_version)
    }

    /// Persist the provider configuration at an explicit version, as used by
    /// a follower applying a config snapshot received from its leader.
    pub fn save_versioned(
        &self,
        config: &ProviderConfigStore,
        version: u64,
    ) -> Result<(), ConfigStoreError> {
        let path = self.dir.join(CONFIG_FILE);
        let persisted = PersistedConfig {
            version,
            store: config.clone(),
        };
        let body = serde_json::to_string_pretty(&persisted)?;
        write_atomic(&path, body.as_bytes())?;
        Ok(())
    }

    /// A redacted view of `config` safe to log or display: sensitive fields
    /// are replaced with a literal, and path-like fields report only
    /// whether the referenced file exists.
    pub fn redacted_view(config: &ProviderConfigStore) -> Value {
        let mut providers = serde_json::Map::new();
        for (name, entry) in &config.providers {
            let mut fields = serde_json::Map::new();
            for (key, value) in &entry.fields {
                let redacted = if is_path_field(key) {
                    let exists = value
                        .as_str()
                        .map(|p| Path::new(p).exists())
                        .unwrap_or(false);
                    serde_json::json!({ "path": value, "exists": exists })
                } else if is_sensitive(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    value.clone()
                };
                fields.insert(key.clone(), redacted);
            }
            providers.insert(
                name.clone(),
                serde_json::json!({
                    "provider_type": entry.provider_type,
                    "ttl_seconds": entry.ttl_seconds,
                    "fields": fields,
                }),
            );
        }
        Value::Object(serde_json::Map::from_iter([(
            "providers".to_string(),
            Value::Object(providers),
        )]))
    }
}

/// Apply a small allow-listed set of environment overrides: a default TTL
/// applied to any provider that does not declare its own.
fn apply_env_overrides(config: &mut ProviderConfigStore) {
    if let Ok(val) = std::env::var("BROKER_DEFAULT_TTL_SECONDS")
        && let Ok(secs) = val.parse::<u64>()
    {
        for entry in config.providers.values_mut() {
            if entry.ttl_seconds.is_none() {
                entry.ttl_seconds = Some(secs);
            }
        }
    }
}

fn validate(config: &ProviderConfigStore) -> Result<Vec<ConfigWarning>, ConfigStoreError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (name, entry) in &config.providers {
        if entry.provider_type.trim().is_empty() {
            errors.push(format!("provider '{name}': provider_type must not be empty"));
        }
        if let Some(ttl) = entry.ttl_seconds {
            if ttl == 0 || ttl > MAX_TTL_SECONDS {
                errors.push(format!(
                    "provider '{name}': ttl_seconds {ttl} out of range (1..{MAX_TTL_SECONDS})"
                ));
            } else if ttl > LARGE_TTL_THRESHOLD {
                warnings.push(ConfigWarning::LargeTtl {
                    provider: name.clone(),
                    secs: ttl,
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigStoreError::ValidationError { reasons: errors })
    }
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test_helpers::with_env_lock;

    mod serial_test_helpers {
        use std::sync::Mutex;

        static ENV_LOCK: Mutex<()> = Mutex::new(());

        pub fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
            let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            f()
        }
    }

    fn entry(provider_type: &str) -> ProviderConfigEntry {
        ProviderConfigEntry {
            provider_type: provider_type.to_string(),
            ttl_seconds: None,
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn get_or_create_secret_is_stable_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let secret1 = store.get_or_create_secret().unwrap();

        let reopened = ConfigStore::open(dir.path()).unwrap();
        let secret2 = reopened.get_or_create_secret().unwrap();
        assert_eq!(secret1, secret2);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let (config, warnings) = store.load().unwrap();
        assert!(config.providers.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let mut config = ProviderConfigStore::default();
        config.providers.insert("github".to_string(), entry("github"));
        store.save(&config).unwrap();

        let (loaded, _) = store.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn validation_rejects_zero_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let mut config = ProviderConfigStore::default();
        let mut e = entry("github");
        e.ttl_seconds = Some(0);
        config.providers.insert("github".to_string(), e);
        store.save(&config).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, ConfigStoreError::ValidationError { .. }));
    }

    #[test]
    fn large_ttl_produces_warning() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let mut config = ProviderConfigStore::default();
        let mut e = entry("github");
        e.ttl_seconds = Some(7_200);
        config.providers.insert("github".to_string(), e);
        store.save(&config).unwrap();

        let (_, warnings) = store.load().unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeTtl { .. })));
    }

    #[test]
    fn redacted_view_masks_sensitive_fields_and_reports_path_existence() {
        let dir = tempfile::tempdir().unwrap();
        let real_file = dir.path().join("key.pem");
        fs::write(&real_file, b"dummy").unwrap();

        let mut e = entry("github");
        e.fields.insert(
            "apiKey".to_string(),
            Value::String("sk-super-secret".to_string()),
        );
        e.fields.insert(
            "privateKeyPath".to_string(),
            Value::String(real_file.display().to_string()),
        );
        e.fields
            .insert("endpoint".to_string(), Value::String("https://x".to_string()));

        let mut config = ProviderConfigStore::default();
        config.providers.insert("github".to_string(), e);

        let redacted = ConfigStore::redacted_view(&config);
        let github_fields = &redacted["providers"]["github"]["fields"];
        assert_eq!(github_fields["apiKey"], Value::String(REDACTED.to_string()));
        assert_eq!(github_fields["privateKeyPath"]["exists"], Value::Bool(true));
        assert_eq!(
            github_fields["endpoint"],
            Value::String("https://x".to_string())
        );
    }

    #[test]
    fn save_increments_version_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.version().unwrap(), 0);

        let mut config = ProviderConfigStore::default();
        config.providers.insert("github".to_string(), entry("github"));
        store.save(&config).unwrap();
        assert_eq!(store.version().unwrap(), 1);

        store.save(&config).unwrap();
        assert_eq!(store.version().unwrap(), 2);
    }

    #[test]
    fn save_versioned_sets_explicit_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let config = ProviderConfigStore::default();
        store.save_versioned(&config, 7).unwrap();
        assert_eq!(store.version().unwrap(), 7);
    }

    #[test]
    fn env_override_sets_default_ttl_for_providers_without_one() {
        with_env_lock(|| {
            let dir = tempfile::tempdir().unwrap();
            let store = ConfigStore::open(dir.path()).unwrap();
            let mut config = ProviderConfigStore::default();
            config.providers.insert("github".to_string(), entry("github"));
            store.save(&config).unwrap();

            unsafe {
                std::env::set_var("BROKER_DEFAULT_TTL_SECONDS", "120");
            }
            let (loaded, _) = store.load().unwrap();
            unsafe {
                std::env::remove_var("BROKER_DEFAULT_TTL_SECONDS");
            }
            assert_eq!(loaded.providers["github"].ttl_seconds, Some(120));
        });
    }
}
