//! Wire (de)serialization: base64url-encoded JSON of the full token.
//!
//! `deserialize` never re-validates the signature; callers must explicitly
//! call [`crate::engine::verify`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::TokenError;
use crate::model::Token;

/// Serialize a token (all fields, including `signature`) to JSON and
/// base64url-encode it without padding.
pub fn serialize(token: &Token) -> Result<String, TokenError> {
    let json = serde_json::to_string(token)?;
    Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
}

/// Decode and parse a token produced by [`serialize`]. Does not validate the
/// signature or expiry.
pub fn deserialize(wire: &str) -> Result<Token, TokenError> {
    let bytes = URL_SAFE_NO_PAD.decode(wire)?;
    let json = std::str::from_utf8(&bytes)?;
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RootTokenBuilder;
    use crate::engine::verify;

    #[test]
    fn round_trips_byte_for_byte() {
        let key = b"round-trip-key";
        let token = RootTokenBuilder::new("agent-1")
            .scope("github:repo:read")
            .ttl_days(1)
            .build(key)
            .unwrap();

        let wire = serialize(&token).unwrap();
        let decoded = deserialize(&wire).unwrap();
        assert_eq!(token, decoded);
        assert_eq!(verify(&token, key).is_ok(), verify(&decoded, key).is_ok());

        let wire_again = serialize(&decoded).unwrap();
        assert_eq!(wire, wire_again);
    }

    #[test]
    fn deserialize_does_not_validate() {
        let key = b"round-trip-key";
        let mut token = RootTokenBuilder::new("agent-1")
            .scope("github:repo:read")
            .build(key)
            .unwrap();
        token.scopes.push("extra:scope".to_string());
        let wire = serialize(&token).unwrap();
        let decoded = deserialize(&wire).unwrap();
        assert!(verify(&decoded, key).is_err());
    }
}
