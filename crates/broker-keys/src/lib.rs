#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Versioned, persisted HMAC signing key store.
//!
//! Keys are append-only: rotation never deletes a key outright, it marks the
//! previous current key deprecated so that tokens signed under it can still
//! be verified until the key is pruned.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of the signing key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Underlying file I/O failed.
    #[error("key store I/O error: {0}")]
    Io(#[from] io::Error),
    /// The persisted file was not valid JSON in the expected shape.
    #[error("key store is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    /// A key was not valid base64.
    #[error("key is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// An imported key was not exactly 32 bytes.
    #[error("key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// A single signing key, its version, and its lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    /// Monotonically increasing version number.
    pub version: u32,
    /// The raw HMAC key material.
    pub key: [u8; 32],
    /// When this key was created or imported.
    pub created_at: DateTime<Utc>,
    /// When this key stopped being current, if it has.
    pub deprecated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedKey {
    version: u32,
    key: String,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deprecated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStore {
    current_version: u32,
    keys: Vec<PersistedKey>,
}

/// Persisted, versioned signing key store.
pub struct KeyStore {
    path: PathBuf,
    current_version: u32,
    keys: BTreeMap<u32, SigningKey>,
}

impl KeyStore {
    /// Open (or initialize, if absent) a key store backed by `path`. The
    /// containing directory is created with mode 0700 if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        if !path.exists() {
            return Ok(Self {
                path,
                current_version: 0,
                keys: BTreeMap::new(),
            });
        }
        let content = fs::read_to_string(&path)?;
        let persisted: PersistedStore = serde_json::from_str(&content)?;
        let mut keys = BTreeMap::new();
        for k in persisted.keys {
            let bytes = BASE64.decode(k.key)?;
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyStoreError::InvalidKeyLength(bytes.len()))?;
            keys.insert(
                k.version,
                SigningKey {
                    version: k.version,
                    key,
                    created_at: k.created_at,
                    deprecated_at: k.deprecated_at,
                },
            );
        }
        Ok(Self {
            path,
            current_version: persisted.current_version,
            keys,
        })
    }

    /// Return the current key, generating version 1 on first access.
    pub fn get_current(&mut self) -> Result<(&SigningKey, u32), KeyStoreError> {
        if self.current_version == 0 || !self.keys.contains_key(&self.current_version) {
            let key = random_key();
            self.current_version = 1;
            self.keys.insert(
                1,
                SigningKey {
                    version: 1,
                    key,
                    created_at: Utc::now(),
                    deprecated_at: None,
                },
            );
            self.persist()?;
        }
        let version = self.current_version;
        Ok((self.keys.get(&version).expect("current key must exist"), version))
    }

    /// Look up a specific version, for verifying older tokens.
    pub fn get(&self, version: u32) -> Option<&SigningKey> {
        self.keys.get(&version)
    }

    /// Whether any key is retained, without generating one. Used by
    /// followers that must distinguish "no key yet" from "key at version 1".
    pub fn has_any_key(&self) -> bool {
        !self.keys.is_empty()
    }

    /// The current version without generating one; `0` if absent.
    pub fn current_version_no_create(&self) -> u32 {
        if self.keys.contains_key(&self.current_version) {
            self.current_version
        } else {
            0
        }
    }

    /// Generate a new key, deprecate the current one, and persist.
    pub fn rotate(&mut self) -> Result<(&SigningKey, u32), KeyStoreError> {
        let now = Utc::now();
        if let Some(current) = self.keys.get_mut(&self.current_version) {
            current.deprecated_at = Some(now);
        }
        let next_version = self.current_version + 1;
        self.keys.insert(
            next_version,
            SigningKey {
                version: next_version,
                key: random_key(),
                created_at: now,
                deprecated_at: None,
            },
        );
        self.current_version = next_version;
        self.persist()?;
        Ok((
            self.keys.get(&next_version).expect("just inserted"),
            next_version,
        ))
    }

    /// Base64-encode the current key, creating it first if absent.
    pub fn export_current(&mut self) -> Result<String, KeyStoreError> {
        let (key, _) = self.get_current()?;
        Ok(BASE64.encode(key.key))
    }

    /// Base64-encode the key at `version`, if retained.
    pub fn export(&self, version: u32) -> Option<String> {
        self.keys.get(&version).map(|k| BASE64.encode(k.key))
    }

    /// Import a key at `version`. Never overwrites an existing version;
    /// `current_version` advances to `version` only if it is strictly newer.
    pub fn import(&mut self, key_base64: &str, version: u32) -> Result<(), KeyStoreError> {
        let bytes = BASE64.decode(key_base64)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyStoreError::InvalidKeyLength(bytes.len()))?;
        self.keys.entry(version).or_insert_with(|| SigningKey {
            version,
            key,
            created_at: Utc::now(),
            deprecated_at: None,
        });
        if version > self.current_version {
            self.current_version = version;
        }
        self.persist()
    }

    /// Remove non-current keys deprecated more than `retention_days` ago.
    /// Returns the number removed.
    pub fn prune(&mut self, retention_days: i64) -> Result<usize, KeyStoreError> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let current = self.current_version;
        let before = self.keys.len();
        self.keys.retain(|version, key| {
            *version == current
                || match key.deprecated_at {
                    Some(deprecated_at) => deprecated_at > cutoff,
                    None => true,
                }
        });
        let removed = before - self.keys.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// All keys with a version strictly greater than `version`, ascending.
    pub fn keys_since(&self, version: u32) -> Vec<&SigningKey> {
        self.keys
            .range((version + 1)..)
            .map(|(_, key)| key)
            .collect()
    }

    /// Every retained key, most recent version first. Used to verify a
    /// token signed under a not-yet-pruned prior version.
    pub fn all(&self) -> impl Iterator<Item = &SigningKey> {
        self.keys.values().rev()
    }

    fn persist(&self) -> Result<(), KeyStoreError> {
        let persisted = PersistedStore {
            current_version: self.current_version,
            keys: self
                .keys
                .values()
                .map(|k| PersistedKey {
                    version: k.version,
                    key: BASE64.encode(k.key),
                    created_at: k.created_at,
                    deprecated_at: k.deprecated_at,
                })
                .collect(),
        };
        let body = serde_json::to_string_pretty(&persisted)?;
        write_atomic(&self.path, body.as_bytes())
    }
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
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

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), KeyStoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
