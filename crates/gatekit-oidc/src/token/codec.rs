//! Unverified JWT segment decoding.
//!
//! These helpers never verify a signature. They exist for
//! *pre-verification inspection* — reading the header to pick a key
//! resolution strategy, reading `iss` for issuer-based tenant resolution —
//! and for internal tokens whose verification is intentionally skipped.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::error::{OidcError, OidcResult};

/// Number of dot-separated segments in a signed compact JWT.
const JWS_SEGMENT_COUNT: usize = 3;

/// Returns `true` if the token is not a signed compact JWT.
///
/// Opaque tokens (and encrypted five-segment tokens) cannot be inspected
/// locally and are routed to remote introspection instead.
#[must_use]
pub fn is_opaque(token: &str) -> bool {
    token.split('.').count() != JWS_SEGMENT_COUNT
}

/// Decodes the protected header of a compact JWT without verification.
pub fn decode_header(token: &str) -> OidcResult<Value> {
    let segment = token
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OidcError::malformed("token has no header segment"))?;
    decode_json_segment(segment)
}

/// Decodes the claims segment of a compact JWT without verification.
///
/// Returns `None` unless the token has exactly three segments — opaque
/// tokens and encrypted (five-segment) tokens yield `None` rather than an
/// error.
#[must_use]
pub fn decode_claims(token: &str) -> Option<Value> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != JWS_SEGMENT_COUNT {
        return None;
    }
    decode_json_segment(segments[1]).ok()
}

/// Decodes a base64url (no padding) segment.
pub fn decode_segment(segment: &str) -> OidcResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| OidcError::malformed(format!("invalid base64url segment: {e}")))
}

/// Encodes bytes as base64url without padding.
#[must_use]
pub fn encode_segment(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_json_segment(segment: &str) -> OidcResult<Value> {
    let bytes = decode_segment(segment)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OidcError::malformed(format!("segment is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(header: &Value, claims: &Value) -> String {
        format!(
            "{}.{}.sig",
            encode_segment(serde_json::to_string(header).unwrap().as_bytes()),
            encode_segment(serde_json::to_string(claims).unwrap().as_bytes()),
        )
    }

    #[test]
    fn test_is_opaque() {
        assert!(is_opaque("a-random-opaque-token"));
        assert!(is_opaque("two.segments"));
        assert!(is_opaque("a.b.c.d.e")); // encrypted JWE
        assert!(!is_opaque("a.b.c"));
    }

    #[test]
    fn test_decode_header() {
        let token = make_jwt(
            &serde_json::json!({"alg": "RS256", "kid": "k1"}),
            &serde_json::json!({"sub": "alice"}),
        );

        let header = decode_header(&token).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "k1");
    }

    #[test]
    fn test_decode_header_rejects_garbage() {
        assert!(decode_header("!!!.claims.sig").is_err());
        assert!(decode_header("").is_err());

        let not_json = format!("{}.x.y", encode_segment(b"plainly not json"));
        assert!(decode_header(&not_json).is_err());
    }

    #[test]
    fn test_decode_claims() {
        let token = make_jwt(
            &serde_json::json!({"alg": "RS256"}),
            &serde_json::json!({"iss": "https://op.example.com", "sub": "alice"}),
        );

        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims["iss"], "https://op.example.com");
        assert_eq!(claims["sub"], "alice");
    }

    #[test]
    fn test_decode_claims_wrong_segment_count() {
        assert!(decode_claims("opaque").is_none());
        assert!(decode_claims("a.b").is_none());
        assert!(decode_claims("a.b.c.d.e").is_none());
    }

    #[test]
    fn test_segment_round_trip() {
        let data = b"some bytes \x00\xff";
        let encoded = encode_segment(data);
        assert!(!encoded.contains('='));
        assert_eq!(decode_segment(&encoded).unwrap(), data);
    }
}
