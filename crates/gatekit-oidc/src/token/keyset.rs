//! In-memory JSON Web Key Set representation.
//!
//! A [`KeySet`] is built wholesale from one JWKS fetch and never mutated in
//! place — a refresh publishes a brand new set. Keys are indexed by `kid`,
//! by SHA-1 certificate thumbprint (`x5t`) and by SHA-256 certificate
//! thumbprint (`x5t#S256`); a single key carrying none of those identifiers
//! is kept as the "keyless" fallback for providers that publish exactly one
//! anonymous key.
//!
//! Unsupported key types (anything but RSA/EC/OKP) and non-signature keys
//! (`use` other than `sig`) are filtered out. Only a JWKS document that
//! cannot be parsed at all is a construction error; an empty-but-valid set
//! is allowed.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{OidcError, OidcResult};
use crate::token::codec::encode_segment;

/// The type of a verification key, as published in the JWK `kty` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// RSA public key.
    Rsa,
    /// Elliptic-curve public key (P-256/P-384/P-521).
    Ec,
    /// Octet key pair (Ed25519 and friends).
    Okp,
}

/// A single resolved verification key.
pub struct VerificationKey {
    /// The `kid` this key was published under, if any.
    pub key_id: Option<String>,
    /// The decoding key used for signature verification.
    pub decoding_key: DecodingKey,
    /// The algorithm the provider declared for this key, if any.
    pub algorithm: Option<Algorithm>,
    /// The key type.
    pub key_type: KeyType,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

/// An immutable, indexed JSON Web Key Set snapshot.
#[derive(Debug, Default)]
pub struct KeySet {
    by_kid: HashMap<String, Arc<VerificationKey>>,
    by_thumbprint: HashMap<String, Arc<VerificationKey>>,
    by_s256_thumbprint: HashMap<String, Arc<VerificationKey>>,
    keyless: Option<Arc<VerificationKey>>,
    all: Vec<Arc<VerificationKey>>,
}

impl KeySet {
    /// Parses a standard JWK Set document.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the document is not valid JSON or has
    /// no `keys` array. Individual keys that are unsupported or fail to
    /// convert are skipped with a warning, not an error.
    pub fn from_jwks_json(json: &str) -> OidcResult<Self> {
        let document: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| OidcError::malformed(format!("invalid JWKS document: {e}")))?;
        Self::from_jwks_value(&document)
    }

    /// Builds a key set from an already-parsed JWKS document.
    pub fn from_jwks_value(document: &serde_json::Value) -> OidcResult<Self> {
        let keys = document
            .get("keys")
            .and_then(|k| k.as_array())
            .ok_or_else(|| OidcError::malformed("JWKS document has no keys array"))?;

        let mut set = Self::default();
        let mut anonymous: Vec<Arc<VerificationKey>> = Vec::new();

        for raw in keys {
            let Ok(jwk) = serde_json::from_value::<Jwk>(raw.clone()) else {
                tracing::warn!("Skipping JWK with unsupported or invalid parameters");
                continue;
            };

            if matches!(
                jwk.common.public_key_use,
                Some(PublicKeyUse::Encryption) | Some(PublicKeyUse::Other(_))
            ) {
                continue;
            }

            let key_type = match &jwk.algorithm {
                AlgorithmParameters::RSA(_) => KeyType::Rsa,
                AlgorithmParameters::EllipticCurve(_) => KeyType::Ec,
                AlgorithmParameters::OctetKeyPair(_) => KeyType::Okp,
                AlgorithmParameters::OctetKey(_) => continue,
            };

            let Ok(decoding_key) = DecodingKey::from_jwk(&jwk) else {
                tracing::warn!(
                    "Skipping JWK {:?}: cannot convert to a decoding key",
                    jwk.common.key_id
                );
                continue;
            };

            let key = Arc::new(VerificationKey {
                key_id: jwk.common.key_id.clone(),
                decoding_key,
                algorithm: jwk_algorithm(&jwk),
                key_type,
            });

            let (sha1_tp, sha256_tp) = certificate_thumbprints(&jwk);

            let mut identified = false;
            if let Some(kid) = &jwk.common.key_id {
                set.by_kid.insert(kid.clone(), Arc::clone(&key));
                identified = true;
            }
            if let Some(tp) = sha1_tp {
                set.by_thumbprint.insert(tp, Arc::clone(&key));
                identified = true;
            }
            if let Some(tp) = sha256_tp {
                set.by_s256_thumbprint.insert(tp, Arc::clone(&key));
                identified = true;
            }
            if !identified {
                anonymous.push(Arc::clone(&key));
            }

            set.all.push(key);
        }

        // A provider publishing exactly one key without kid or thumbprint
        // still gets matched: that key becomes the keyless fallback.
        if anonymous.len() == 1 {
            set.keyless = anonymous.pop();
        }

        tracing::debug!(
            "Built key set with {} keys ({} by kid, keyless: {})",
            set.all.len(),
            set.by_kid.len(),
            set.keyless.is_some()
        );

        Ok(set)
    }

    /// Looks up a key by its `kid`.
    #[must_use]
    pub fn get_by_key_id(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.by_kid.get(kid).cloned()
    }

    /// Looks up a key by SHA-1 certificate thumbprint (`x5t`).
    #[must_use]
    pub fn get_by_thumbprint(&self, thumbprint: &str) -> Option<Arc<VerificationKey>> {
        self.by_thumbprint.get(thumbprint).cloned()
    }

    /// Looks up a key by SHA-256 certificate thumbprint (`x5t#S256`).
    #[must_use]
    pub fn get_by_s256_thumbprint(&self, thumbprint: &str) -> Option<Arc<VerificationKey>> {
        self.by_s256_thumbprint.get(thumbprint).cloned()
    }

    /// Returns the keyless fallback key, optionally restricted to a key
    /// type derived from the token's algorithm.
    #[must_use]
    pub fn get_keyless(&self, key_type: Option<KeyType>) -> Option<Arc<VerificationKey>> {
        let key = self.keyless.as_ref()?;
        match key_type {
            Some(kt) if key.key_type != kt => None,
            _ => Some(Arc::clone(key)),
        }
    }

    /// Returns every signature key in the set, for try-all verification.
    #[must_use]
    pub fn keys(&self) -> &[Arc<VerificationKey>] {
        &self.all
    }

    /// Returns the number of keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Returns `true` if the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Returns (SHA-1, SHA-256) certificate thumbprints for a JWK, taken from
/// the published `x5t`/`x5t#S256` members or derived from the first
/// certificate of the embedded `x5c` chain.
fn certificate_thumbprints(jwk: &Jwk) -> (Option<String>, Option<String>) {
    let mut sha1_tp = jwk.common.x509_sha1_fingerprint.clone();
    let mut sha256_tp = jwk.common.x509_sha256_fingerprint.clone();

    if (sha1_tp.is_none() || sha256_tp.is_none())
        && let Some(chain) = &jwk.common.x509_chain
        && let Some(leaf) = chain.first()
        && let Ok(der) = BASE64_STANDARD.decode(leaf)
    {
        if sha1_tp.is_none() {
            sha1_tp = Some(encode_segment(&Sha1::digest(&der)));
        }
        if sha256_tp.is_none() {
            sha256_tp = Some(encode_segment(&Sha256::digest(&der)));
        }
    }

    (sha1_tp, sha256_tp)
}

/// Maps the JWK `alg` member to a verification algorithm.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    use jsonwebtoken::jwk::KeyAlgorithm;

    jwk.common.key_algorithm.and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_RSA_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    fn rsa_jwk(kid: Option<&str>) -> serde_json::Value {
        let mut jwk = serde_json::json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "n": TEST_RSA_N,
            "e": "AQAB"
        });
        if let Some(kid) = kid {
            jwk["kid"] = serde_json::Value::String(kid.to_string());
        }
        jwk
    }

    #[test]
    fn test_indexes_by_kid() {
        let jwks = serde_json::json!({"keys": [rsa_jwk(Some("k1")), rsa_jwk(Some("k2"))]});
        let set = KeySet::from_jwks_value(&jwks).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.get_by_key_id("k1").is_some());
        assert!(set.get_by_key_id("k2").is_some());
        assert!(set.get_by_key_id("missing").is_none());
        assert!(set.get_keyless(None).is_none());
    }

    #[test]
    fn test_filters_encryption_and_symmetric_keys() {
        let mut enc = rsa_jwk(Some("enc-key"));
        enc["use"] = serde_json::Value::String("enc".to_string());
        let oct = serde_json::json!({
            "kty": "oct",
            "kid": "hmac-key",
            "k": "c2VjcmV0"
        });

        let jwks = serde_json::json!({"keys": [rsa_jwk(Some("sig-key")), enc, oct]});
        let set = KeySet::from_jwks_value(&jwks).unwrap();

        assert_eq!(set.len(), 1);
        assert!(set.get_by_key_id("sig-key").is_some());
        assert!(set.get_by_key_id("enc-key").is_none());
        assert!(set.get_by_key_id("hmac-key").is_none());
    }

    #[test]
    fn test_keyless_fallback_single_anonymous_key() {
        let jwks = serde_json::json!({"keys": [rsa_jwk(None)]});
        let set = KeySet::from_jwks_value(&jwks).unwrap();

        assert!(set.get_keyless(None).is_some());
        assert!(set.get_keyless(Some(KeyType::Rsa)).is_some());
        assert!(set.get_keyless(Some(KeyType::Ec)).is_none());
    }

    #[test]
    fn test_no_keyless_when_two_anonymous_keys() {
        let jwks = serde_json::json!({"keys": [rsa_jwk(None), rsa_jwk(None)]});
        let set = KeySet::from_jwks_value(&jwks).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.get_keyless(None).is_none());
    }

    #[test]
    fn test_thumbprint_index_from_x5t() {
        let mut jwk = rsa_jwk(None);
        jwk["x5t"] = serde_json::Value::String("sha1-thumb".to_string());
        jwk["x5t#S256"] = serde_json::Value::String("sha256-thumb".to_string());

        let jwks = serde_json::json!({"keys": [jwk]});
        let set = KeySet::from_jwks_value(&jwks).unwrap();

        assert!(set.get_by_thumbprint("sha1-thumb").is_some());
        assert!(set.get_by_s256_thumbprint("sha256-thumb").is_some());
        // A thumbprint-identified key is not the keyless fallback.
        assert!(set.get_keyless(None).is_none());
    }

    #[test]
    fn test_invalid_document_is_an_error() {
        assert!(KeySet::from_jwks_json("not json at all").is_err());
        assert!(KeySet::from_jwks_json(r#"{"no_keys": true}"#).is_err());
    }

    #[test]
    fn test_empty_set_is_valid() {
        let set = KeySet::from_jwks_json(r#"{"keys": []}"#).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_unparsable_key_is_skipped() {
        let jwks = serde_json::json!({"keys": [
            rsa_jwk(Some("good")),
            {"kty": "EC", "kid": "truncated"}
        ]});
        let set = KeySet::from_jwks_value(&jwks).unwrap();

        assert_eq!(set.len(), 1);
        assert!(set.get_by_key_id("good").is_some());
    }
}
