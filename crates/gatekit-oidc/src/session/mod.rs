//! Cookie-based token state serialization.
//!
//! The session cookie is the only session state this core keeps — any
//! instance can decode any other instance's cookie, so multi-instance
//! deployments need no shared storage. Token values are concatenated with
//! a `|` delimiter (or split into dedicated cookies under the split-token
//! policy), optionally encrypted with AES-256-GCM, and chunked into
//! numbered cookies when they exceed the browser-safe length.
//!
//! - [`cookie`] - cookie naming and attribute policy

pub mod cookie;

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::config::TokenStateConfig;
use crate::error::{OidcError, OidcResult};
use crate::provider::AuthorizationCodeTokens;
use crate::token::codec::{decode_segment, encode_segment};

pub use cookie::{
    ACCESS_TOKEN_COOKIE_SUFFIX, CHUNK_INFIX, POST_LOGOUT_COOKIE_NAME, REFRESH_TOKEN_COOKIE_SUFFIX,
    SESSION_COOKIE_NAME, STATE_COOKIE_MAX_AGE, STATE_COOKIE_NAME, build_cookie,
    cookie_name_suffix, post_logout_cookie_name, removal_cookie, session_cookie_name,
    state_cookie_name,
};

/// Delimiter between the ID, access and refresh tokens in one cookie.
const TOKEN_DELIMITER: char = '|';

/// Browser-safe cookie value threshold; longer values are chunked.
pub const MAX_COOKIE_VALUE_LEN: usize = 4056;

/// Nonce size for AES-256-GCM.
const NONCE_SIZE: usize = 12;

/// Encodes and decodes token state cookies for one tenant.
pub struct SessionCodec {
    encryption_key: [u8; 32],
}

impl SessionCodec {
    /// Creates a codec with the tenant's token-encryption key.
    #[must_use]
    pub fn new(encryption_key: [u8; 32]) -> Self {
        Self { encryption_key }
    }

    /// Encodes tokens into cookie (name, value) pairs under `base_name`.
    ///
    /// With the split-token policy the access and refresh tokens go into
    /// `{base}_at` / `{base}_rt`; otherwise all three share one value.
    /// Oversized values are chunked into `{name}_chunk_N` cookies.
    pub fn encode(
        &self,
        tokens: &AuthorizationCodeTokens,
        policy: &TokenStateConfig,
        base_name: &str,
    ) -> OidcResult<Vec<(String, String)>> {
        let id = tokens.id_token.as_deref().unwrap_or_default();
        let access = tokens.access_token.as_deref().unwrap_or_default();
        let refresh = tokens.refresh_token.as_deref().unwrap_or_default();

        let mut cookies = Vec::new();
        if policy.split_tokens {
            self.push_value(&mut cookies, base_name.to_string(), id, policy)?;
            if !access.is_empty() {
                self.push_value(
                    &mut cookies,
                    format!("{base_name}{ACCESS_TOKEN_COOKIE_SUFFIX}"),
                    access,
                    policy,
                )?;
            }
            if !refresh.is_empty() {
                self.push_value(
                    &mut cookies,
                    format!("{base_name}{REFRESH_TOKEN_COOKIE_SUFFIX}"),
                    refresh,
                    policy,
                )?;
            }
        } else {
            let payload = format!("{id}{TOKEN_DELIMITER}{access}{TOKEN_DELIMITER}{refresh}");
            self.push_value(&mut cookies, base_name.to_string(), &payload, policy)?;
        }
        Ok(cookies)
    }

    /// Decodes tokens from the request cookies.
    ///
    /// Returns `Ok(None)` when no session cookie is present — a missing
    /// cookie is "no session", not an error.
    pub fn decode(
        &self,
        cookies: &HashMap<String, String>,
        policy: &TokenStateConfig,
        base_name: &str,
    ) -> OidcResult<Option<AuthorizationCodeTokens>> {
        let Some(payload) = self.read_value(cookies, base_name, policy)? else {
            return Ok(None);
        };

        let mut tokens = AuthorizationCodeTokens {
            id_token: None,
            access_token: None,
            refresh_token: None,
            access_token_expires_in: None,
            access_token_scope: None,
        };

        if policy.split_tokens {
            tokens.id_token = non_empty(payload);
            tokens.access_token = self
                .read_value(
                    cookies,
                    &format!("{base_name}{ACCESS_TOKEN_COOKIE_SUFFIX}"),
                    policy,
                )?
                .and_then(non_empty);
            tokens.refresh_token = self
                .read_value(
                    cookies,
                    &format!("{base_name}{REFRESH_TOKEN_COOKIE_SUFFIX}"),
                    policy,
                )?
                .and_then(non_empty);
        } else {
            let mut parts = payload.splitn(3, TOKEN_DELIMITER);
            tokens.id_token = parts.next().map(String::from).and_then(non_empty);
            tokens.access_token = parts.next().map(String::from).and_then(non_empty);
            tokens.refresh_token = parts.next().map(String::from).and_then(non_empty);
        }

        Ok(Some(tokens))
    }

    fn push_value(
        &self,
        cookies: &mut Vec<(String, String)>,
        name: String,
        value: &str,
        policy: &TokenStateConfig,
    ) -> OidcResult<()> {
        let value = if policy.encryption_required {
            self.encrypt(value)?
        } else {
            value.to_string()
        };
        cookies.extend(chunk_value(&name, &value));
        Ok(())
    }

    fn read_value(
        &self,
        cookies: &HashMap<String, String>,
        name: &str,
        policy: &TokenStateConfig,
    ) -> OidcResult<Option<String>> {
        let Some(raw) = reassemble(cookies, name) else {
            return Ok(None);
        };
        if policy.encryption_required {
            self.decrypt(&raw).map(Some)
        } else {
            Ok(Some(raw))
        }
    }

    /// Encrypts a payload as base64url(nonce || ciphertext).
    ///
    /// Also used for the state-cookie payload carrying the PKCE verifier
    /// and nonce across the authorization redirect.
    pub(crate) fn encrypt(&self, plaintext: &str) -> OidcResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| OidcError::session(format!("cannot create cipher: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| OidcError::session(format!("session encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(encode_segment(&combined))
    }

    pub(crate) fn decrypt(&self, encoded: &str) -> OidcResult<String> {
        let combined = decode_segment(encoded)
            .map_err(|_| OidcError::session("session cookie is not valid base64"))?;
        if combined.len() <= NONCE_SIZE {
            return Err(OidcError::session("session cookie payload is truncated"));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| OidcError::session(format!("cannot create cipher: {e}")))?;
        let nonce = Nonce::from_slice(&combined[..NONCE_SIZE]);

        let plaintext = cipher
            .decrypt(nonce, &combined[NONCE_SIZE..])
            .map_err(|_| OidcError::session("session cookie cannot be decrypted"))?;
        String::from_utf8(plaintext)
            .map_err(|_| OidcError::session("decrypted session payload is not UTF-8"))
    }
}

/// Splits an oversized value into `{name}_chunk_N` cookies; a value under
/// the threshold stays in a single cookie.
fn chunk_value(name: &str, value: &str) -> Vec<(String, String)> {
    if value.len() <= MAX_COOKIE_VALUE_LEN {
        return vec![(name.to_string(), value.to_string())];
    }

    value
        .as_bytes()
        .chunks(MAX_COOKIE_VALUE_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            (
                format!("{name}{CHUNK_INFIX}{}", i + 1),
                // Chunk boundaries fall on ASCII cookie characters.
                String::from_utf8_lossy(chunk).into_owned(),
            )
        })
        .collect()
}

/// Reassembles a cookie value: the direct cookie, or its chunk cookies
/// sorted numerically by trailing index.
fn reassemble(cookies: &HashMap<String, String>, name: &str) -> Option<String> {
    if let Some(value) = cookies.get(name) {
        return Some(value.clone());
    }

    let prefix = format!("{name}{CHUNK_INFIX}");
    let mut chunks: Vec<(u32, &str)> = cookies
        .iter()
        .filter_map(|(cookie_name, value)| {
            let index = cookie_name.strip_prefix(&prefix)?.parse::<u32>().ok()?;
            Some((index, value.as_str()))
        })
        .collect();

    if chunks.is_empty() {
        return None;
    }

    chunks.sort_by_key(|(index, _)| *index);
    Some(chunks.into_iter().map(|(_, value)| value).collect())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SessionCodec {
        SessionCodec::new([7u8; 32])
    }

    fn tokens() -> AuthorizationCodeTokens {
        AuthorizationCodeTokens {
            id_token: Some("header.claims.sig".to_string()),
            access_token: Some("access-token".to_string()),
            refresh_token: Some("refresh-token".to_string()),
            access_token_expires_in: None,
            access_token_scope: None,
        }
    }

    fn as_map(cookies: Vec<(String, String)>) -> HashMap<String, String> {
        cookies.into_iter().collect()
    }

    #[test]
    fn test_round_trip_all_policies() {
        let codec = codec();
        let tokens = tokens();

        for (split, encrypted) in [(false, false), (false, true), (true, false), (true, true)] {
            let policy = TokenStateConfig {
                split_tokens: split,
                encryption_required: encrypted,
                encryption_secret: None,
            };
            let encoded = codec.encode(&tokens, &policy, "q_session").unwrap();
            let decoded = codec
                .decode(&as_map(encoded), &policy, "q_session")
                .unwrap()
                .unwrap();
            assert_eq!(decoded, tokens, "split={split} encrypted={encrypted}");
        }
    }

    #[test]
    fn test_split_policy_uses_dedicated_cookies() {
        let policy = TokenStateConfig {
            split_tokens: true,
            ..TokenStateConfig::default()
        };
        let encoded = as_map(codec().encode(&tokens(), &policy, "q_session").unwrap());

        assert_eq!(encoded["q_session"], "header.claims.sig");
        assert_eq!(encoded["q_session_at"], "access-token");
        assert_eq!(encoded["q_session_rt"], "refresh-token");
    }

    #[test]
    fn test_missing_cookie_is_no_session() {
        let decoded = codec()
            .decode(&HashMap::new(), &TokenStateConfig::default(), "q_session")
            .unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_missing_id_token_round_trips_as_none() {
        let policy = TokenStateConfig::default();
        let partial = AuthorizationCodeTokens {
            id_token: None,
            access_token: Some("at".to_string()),
            refresh_token: None,
            access_token_expires_in: None,
            access_token_scope: None,
        };
        let encoded = codec().encode(&partial, &policy, "q_session").unwrap();
        let decoded = codec()
            .decode(&as_map(encoded), &policy, "q_session")
            .unwrap()
            .unwrap();
        assert_eq!(decoded, partial);
    }

    #[test]
    fn test_encrypted_cookie_is_opaque_and_tamper_proof() {
        let policy = TokenStateConfig {
            encryption_required: true,
            ..TokenStateConfig::default()
        };
        let encoded = as_map(codec().encode(&tokens(), &policy, "q_session").unwrap());
        let value = &encoded["q_session"];
        assert!(!value.contains("access-token"));

        // A different key cannot decrypt it.
        let other = SessionCodec::new([9u8; 32]);
        assert!(other.decode(&encoded, &policy, "q_session").is_err());

        // Tampering is detected.
        let mut tampered = encoded.clone();
        let mut flipped = value.clone();
        flipped.replace_range(0..1, if value.starts_with('A') { "B" } else { "A" });
        tampered.insert("q_session".to_string(), flipped);
        assert!(codec().decode(&tampered, &policy, "q_session").is_err());
    }

    #[test]
    fn test_chunking_idempotence() {
        let threshold = MAX_COOKIE_VALUE_LEN;
        for len in [0, threshold - 1, threshold, threshold + 1, threshold * 10] {
            let value: String = "a".repeat(len);
            let chunks = chunk_value("q_session", &value);
            let map: HashMap<String, String> = chunks.into_iter().collect();
            let reassembled = reassemble(&map, "q_session").unwrap_or_default();
            assert_eq!(reassembled, value, "length {len}");
        }
    }

    #[test]
    fn test_chunks_reassemble_in_numeric_order() {
        // Ten-plus chunks force a numeric (not lexicographic) sort:
        // lexicographic would put _chunk_10 before _chunk_2.
        let value: String = (0..12)
            .map(|i| {
                char::from(b'a' + u8::try_from(i).unwrap())
                    .to_string()
                    .repeat(MAX_COOKIE_VALUE_LEN)
            })
            .collect();
        let map: HashMap<String, String> = chunk_value("q_session", &value).into_iter().collect();
        assert!(map.contains_key("q_session_chunk_12"));
        assert_eq!(reassemble(&map, "q_session").unwrap(), value);
    }

    #[test]
    fn test_oversized_token_round_trip() {
        let policy = TokenStateConfig {
            encryption_required: true,
            ..TokenStateConfig::default()
        };
        let big = AuthorizationCodeTokens {
            id_token: Some("x".repeat(3 * MAX_COOKIE_VALUE_LEN)),
            access_token: Some("y".repeat(2 * MAX_COOKIE_VALUE_LEN)),
            refresh_token: Some("rt".to_string()),
            access_token_expires_in: None,
            access_token_scope: None,
        };
        let encoded = codec().encode(&big, &policy, "q_session").unwrap();
        assert!(encoded.len() > 1);
        assert!(encoded.iter().all(|(_, v)| v.len() <= MAX_COOKIE_VALUE_LEN));

        let decoded = codec()
            .decode(&as_map(encoded), &policy, "q_session")
            .unwrap()
            .unwrap();
        assert_eq!(decoded, big);
    }
}
