#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Single-process, in-memory credential cache.
//!
//! Keyed by `"<scope>:<resource>"`; a stored credential remains valid for
//! lookup only while `expires_at - buffer > now`, so callers never hand out a
//! credential that is about to expire mid-use.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use broker_provider::IssuedCredential;

const DEFAULT_BUFFER_SECONDS: i64 = 5 * 60;

/// Summary of the cache's contents at a point in time.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of entries currently stored.
    pub size: usize,
    /// Every key paired with its stored expiry.
    pub entries: Vec<(String, Option<DateTime<Utc>>)>,
}

/// In-memory `(scope, resource) -> credential` cache.
pub struct CredentialCache {
    entries: HashMap<String, IssuedCredential>,
    buffer: Duration,
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialCache {
    /// Create an empty cache with the default 5-minute safety buffer.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            buffer: Duration::seconds(DEFAULT_BUFFER_SECONDS),
        }
    }

    /// Override the safety buffer.
    pub fn set_buffer(&mut self, buffer: Duration) {
        self.buffer = buffer;
    }

    /// The cache key for a `(scope, resource)` pair.
    pub fn key(scope: &str, resource: &str) -> String {
        format!("{scope}:{resource}")
    }

    /// Look up a credential, returning `None` if absent or within the safety
    /// buffer of expiry.
    pub fn get(&self, scope: &str, resource: &str) -> Option<&IssuedCredential> {
        let entry = self.entries.get(&Self::key(scope, resource))?;
        match entry.expires_at {
            Some(expires_at) if expires_at - self.buffer <= Utc::now() => None,
            _ => Some(entry),
        }
    }

    /// Store an issued credential. Only credentials with a non-null
    /// `expires_at` are admitted — nothing to bound a cache entry's lifetime
    /// otherwise.
    pub fn put(&mut self, scope: &str, resource: &str, credential: IssuedCredential) {
        if credential.expires_at.is_none() {
            return;
        }
        self.entries.insert(Self::key(scope, resource), credential);
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove entries that are already within the safety buffer of expiry
    /// (or past it); returns the number removed.
    pub fn evict_expired(&mut self) -> usize {
        let buffer = self.buffer;
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !matches!(entry.expires_at, Some(e) if e - buffer <= now));
        before - self.entries.len()
    }

    /// Current size and per-key expiries.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.expires_at))
                .collect(),
        }
    }
}
