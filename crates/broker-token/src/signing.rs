//! Canonical serialization and HMAC signing/verification.
//!
//! Mirrors the canonicalize-then-hash idiom used elsewhere in this codebase
//! for content-addressed records, but with a keyed MAC in place of a bare
//! digest, and constant-time verification.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, KeyInit, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::TokenError;
use crate::model::Token;

type HmacSha256 = Hmac<Sha256>;

/// Serialize `token` to JSON with the `signature` field nulled out, producing
/// the exact byte string the signature is computed over.
///
/// Field order is whatever `serde_json::Map`'s default (BTreeMap-backed,
/// alphabetically sorted) ordering produces, which is stable across
/// platforms and process runs — the property the HMAC's security depends on.
pub fn canonicalize(token: &Token) -> Result<String, TokenError> {
    let mut value = serde_json::to_value(token)?;
    if let Value::Object(map) = &mut value {
        map.insert("signature".to_string(), Value::Null);
    }
    Ok(serde_json::to_string(&value)?)
}

/// Compute `base64url(HMAC-SHA256(key, canonical_json(token_without_signature)))`.
pub fn compute_signature(token: &Token, key: &[u8]) -> Result<String, TokenError> {
    let canonical = canonicalize(token)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?;
    mac.update(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Verify `token.signature` against `key` using a constant-time MAC
/// comparison. Returns `false` on any malformed input rather than erroring,
/// since an attacker-supplied token is exactly the input this guards against.
pub fn verify_signature(token: &Token, key: &[u8]) -> bool {
    let Ok(canonical) = canonicalize(token) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(&token.signature) else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&sig_bytes).is_ok()
}
