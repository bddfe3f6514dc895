#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Versioned, persisted set of revoked token identifiers.
//!
//! Every mutation bumps a monotonic `version`, so followers can request only
//! the entries added since the version they last saw.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of the revocation set.
#[derive(Debug, Error)]
pub enum RevocationError {
    /// Underlying file I/O failed.
    #[error("revocation store I/O error: {0}")]
    Io(#[from] io::Error),
    /// The persisted file was not valid JSON in the expected shape.
    #[error("revocation store is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A single revocation entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationRecord {
    /// The revoked token's identifier.
    pub token_id: String,
    /// The agent the token belonged to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// When the revocation was recorded.
    pub revoked_at: DateTime<Utc>,
    /// Optional human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// If set, the revocation itself lazily expires (the token would have
    /// expired on its own by then anyway).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// The revocation-set version at which this entry was added.
    pub added_at_version: u64,
}

/// Parameters for a new revocation.
#[derive(Debug, Clone, Default)]
pub struct RevokeParams {
    /// The token identifier to revoke.
    pub token_id: String,
    /// The agent the token belonged to, if known.
    pub agent_id: Option<String>,
    /// Optional human-readable reason.
    pub reason: Option<String>,
    /// Optional lazy-expiry for the revocation entry itself.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStore {
    version: u64,
    revocations: Vec<RevocationRecord>,
}

/// Persisted, versioned revocation set.
pub struct RevocationSet {
    path: PathBuf,
    version: u64,
    entries: BTreeMap<String, RevocationRecord>,
}

impl RevocationSet {
    /// Open (or initialize, if absent) a revocation set backed by `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RevocationError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        if !path.exists() {
            return Ok(Self {
                path,
                version: 0,
                entries: BTreeMap::new(),
            });
        }
        let content = fs::read_to_string(&path)?;
        let persisted: PersistedStore = serde_json::from_str(&content)?;
        let entries = persisted
            .revocations
            .into_iter()
            .map(|r| (r.token_id.clone(), r))
            .collect();
        Ok(Self {
            path,
            version: persisted.version,
            entries,
        })
    }

    /// The current version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether `token_id` is currently revoked. An entry whose own
    /// `expires_at` has passed is lazily deleted and reports `false`.
    pub fn is_revoked(&mut self, token_id: &str) -> Result<bool, RevocationError> {
        let Some(entry) = self.entries.get(token_id) else {
            return Ok(false);
        };
        match entry.expires_at {
            Some(expires_at) if expires_at <= Utc::now() => {
                self.entries.remove(token_id);
                self.persist()?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Record a revocation, bumping the version.
    pub fn revoke(&mut self, params: RevokeParams) -> Result<(), RevocationError> {
        self.version += 1;
        self.entries.insert(
            params.token_id.clone(),
            RevocationRecord {
                token_id: params.token_id,
                agent_id: params.agent_id,
                revoked_at: Utc::now(),
                reason: params.reason,
                expires_at: params.expires_at,
                added_at_version: self.version,
            },
        );
        self.persist()
    }

    /// Remove a revocation. Returns `true` if one existed; bumps the version
    /// only on success.
    pub fn unrevoke(&mut self, token_id: &str) -> Result<bool, RevocationError> {
        if self.entries.remove(token_id).is_none() {
            return Ok(false);
        }
        self.version += 1;
        self.persist()?;
        Ok(true)
    }

    /// The number of currently tracked revocation entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Token ids added strictly after `version`.
    pub fn revocations_since(&self, version: u64) -> Vec<String> {
        self.entries
            .values()
            .filter(|r| r.added_at_version > version)
            .map(|r| r.token_id.clone())
            .collect()
    }

    /// Follower path: apply a delta received from the leader. Inserts
    /// minimal placeholder entries for any token id not already known, and
    /// sets the local version to `new_version`.
    pub fn apply_delta(
        &mut self,
        token_ids: &[String],
        new_version: u64,
    ) -> Result<(), RevocationError> {
        let now = Utc::now();
        for token_id in token_ids {
            self.entries.entry(token_id.clone()).or_insert_with(|| RevocationRecord {
                token_id: token_id.clone(),
                agent_id: None,
                revoked_at: now,
                reason: None,
                expires_at: None,
                added_at_version: new_version,
            });
        }
        self.version = new_version;
        self.persist()
    }

    /// Remove entries whose `expires_at` has passed. Returns the count
    /// removed.
    pub fn prune(&mut self) -> Result<usize, RevocationError> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, r| !matches!(r.expires_at, Some(e) if e <= now));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), RevocationError> {
        let persisted = PersistedStore {
            version: self.version,
            revocations: self.entries.values().cloned().collect(),
        };
        let body = serde_json::to_string_pretty(&persisted)?;
        write_atomic(&self.path, body.as_bytes())?;
        Ok(())
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

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("revocations.json")
    }

    #[test]
    fn revoke_then_is_revoked() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(set.is_revoked("t1").unwrap());
        assert!(!set.is_revoked("unknown").unwrap());
    }

    #[test]
    fn revoke_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        assert_eq!(set.version(), 0);
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(set.version(), 1);
    }

    #[test]
    fn unrevoke_removes_and_bumps_version_only_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(set.unrevoke("t1").unwrap());
        assert!(!set.is_revoked("t1").unwrap());

        let version_after = set.version();
        assert!(!set.unrevoke("t1").unwrap());
        assert_eq!(set.version(), version_after);
    }

    #[test]
    fn expired_entry_is_lazily_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..Default::default()
        })
        .unwrap();
        assert!(!set.is_revoked("t1").unwrap());
    }

    #[test]
    fn revocations_since_returns_only_newer_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            ..Default::default()
        })
        .unwrap();
        let v1 = set.version();
        set.revoke(RevokeParams {
            token_id: "t2".into(),
            ..Default::default()
        })
        .unwrap();
        let delta = set.revocations_since(v1);
        assert_eq!(delta, vec!["t2".to_string()]);
    }

    #[test]
    fn apply_delta_inserts_placeholders_and_sets_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        set.apply_delta(&["a".to_string(), "b".to_string()], 5)
            .unwrap();
        assert!(set.is_revoked("a").unwrap());
        assert!(set.is_revoked("b").unwrap());
        assert_eq!(set.version(), 5);
    }

    #[test]
    fn prune_removes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RevocationSet::open(store_path(&dir)).unwrap();
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..Default::default()
        })
        .unwrap();
        // Bypass lazy cleanup on is_revoked by pruning directly.
        assert_eq!(set.prune().unwrap(), 1);
        assert_eq!(set.prune().unwrap(), 0);
    }

    #[test]
    fn reload_from_disk_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let mut set = RevocationSet::open(&path).unwrap();
        set.revoke(RevokeParams {
            token_id: "t1".into(),
            reason: Some("compromised".into()),
            ..Default::default()
        })
        .unwrap();

        let mut reloaded = RevocationSet::open(&path).unwrap();
        assert!(reloaded.is_revoked("t1").unwrap());
        assert_eq!(reloaded.version(), 1);
    }
}
