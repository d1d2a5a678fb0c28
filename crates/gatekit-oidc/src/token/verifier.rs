//! JWS signature verification and claim validation.
//!
//! The verifier resolves a key through a [`KeyResolver`], checks the
//! signature against an algorithm allow-list, then applies the configured
//! claim rules: issuer, audience, expiry, issued-at, subject, nonce,
//! required claims and pluggable custom validators. After structural and
//! signature success the token age is re-checked against the configured
//! maximum — even for tokens whose expiry requirement was relaxed, such as
//! back-channel logout tokens.

use std::collections::HashMap;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::error::{OidcError, OidcResult, TokenValidationKind};
use crate::token::resolver::{KeyResolver, ResolvedKey, TokenHeaders};

/// Audience validation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudienceRequirement {
    /// Do not check the `aud` claim.
    Skip,
    /// The `aud` claim must contain one of these values.
    Exact(Vec<String>),
    /// The `aud` claim must contain the tenant's client id.
    ClientId(String),
}

/// The claim rules applied to one verification call.
#[derive(Debug, Clone)]
pub struct TokenRequirements {
    /// Expected `iss` value; `None` disables the issuer check.
    pub issuer: Option<String>,
    /// Audience validation mode.
    pub audience: AudienceRequirement,
    /// Whether the token must carry an unexpired `exp`.
    pub expiry_required: bool,
    /// Whether the token must carry `iat`.
    pub issued_at_required: bool,
    /// Whether the token must carry `sub`.
    pub subject_required: bool,
    /// Expected `nonce` value, when the authorization request sent one.
    pub nonce: Option<String>,
    /// Allowed signature algorithms; empty means "whatever the token
    /// header declares".
    pub allowed_algorithms: Vec<Algorithm>,
    /// Additional claims that must be present, each checked by scalar
    /// equality or array containment.
    pub required_claims: HashMap<String, Value>,
    /// Maximum accepted token age (now − `iat`).
    pub max_age: Option<Duration>,
    /// Clock-skew grace applied to expiry and age checks.
    pub clock_skew: Duration,
}

impl Default for TokenRequirements {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: AudienceRequirement::Skip,
            expiry_required: true,
            issued_at_required: false,
            subject_required: false,
            nonce: None,
            allowed_algorithms: Vec::new(),
            required_claims: HashMap::new(),
            max_age: None,
            clock_skew: Duration::from_secs(30),
        }
    }
}

/// A pluggable claim validator.
///
/// A validator that demands a stronger authentication context should
/// return an [`TokenValidationKind::InsufficientAuthentication`] failure;
/// its ACR values survive to the challenge. Any other failure is
/// reclassified as a generic claim mismatch.
pub trait ClaimValidator: Send + Sync {
    /// Validates the decoded claims.
    fn validate(&self, claims: &Value) -> OidcResult<()>;
}

/// Successfully verified token claims.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    /// The decoded claim set.
    pub claims: Value,
}

impl VerifiedClaims {
    /// The `sub` claim, if present.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(|v| v.as_str())
    }

    /// The `exp` claim as a unix timestamp, if present.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.claims.get("exp").and_then(|v| v.as_i64())
    }
}

/// Verifies a token end to end: resolve key, check signature, apply rules.
pub async fn verify(
    token: &str,
    resolver: &KeyResolver,
    requirements: &TokenRequirements,
    validators: &[Box<dyn ClaimValidator>],
) -> OidcResult<VerifiedClaims> {
    let headers = TokenHeaders::from_token(token)?;
    let resolved = resolver.resolve(&headers).await?;

    match resolved {
        ResolvedKey::Single(key) => verify_with_key(
            token,
            &key.decoding_key,
            key.algorithm,
            &headers,
            requirements,
            validators,
        ),
        ResolvedKey::TryAll(keys) => {
            let mut last_err =
                OidcError::validation(TokenValidationKind::Signature, "no keys to try");
            for key in keys {
                match verify_with_key(
                    token,
                    &key.decoding_key,
                    key.algorithm,
                    &headers,
                    requirements,
                    validators,
                ) {
                    Ok(verified) => return Ok(verified),
                    Err(err) => last_err = err,
                }
            }
            Err(last_err)
        }
    }
}

/// Verifies a token against a symmetric secret (HS256).
///
/// Used for internally minted ID tokens when the provider issues none.
pub fn verify_self_signed(
    token: &str,
    secret: &[u8],
    requirements: &TokenRequirements,
) -> OidcResult<VerifiedClaims> {
    let headers = TokenHeaders::from_token(token)?;
    verify_with_key(
        token,
        &DecodingKey::from_secret(secret),
        Some(Algorithm::HS256),
        &headers,
        requirements,
        &[],
    )
}

/// Mints a compact HS256 token over the given claims.
pub fn issue_self_signed(claims: &Value, secret: &[u8]) -> OidcResult<String> {
    let header = jsonwebtoken::Header::new(Algorithm::HS256);
    jsonwebtoken::encode(
        &header,
        claims,
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )
    .map_err(|e| OidcError::authentication_failed(format!("cannot mint internal token: {e}")))
}

/// Signature check plus the full claim rule set against one key.
pub fn verify_with_key(
    token: &str,
    key: &DecodingKey,
    key_algorithm: Option<Algorithm>,
    headers: &TokenHeaders,
    requirements: &TokenRequirements,
    validators: &[Box<dyn ClaimValidator>],
) -> OidcResult<VerifiedClaims> {
    let token_algorithm: Algorithm = headers
        .algorithm()
        .ok_or_else(|| OidcError::malformed("token header has no alg"))?
        .parse()
        .map_err(|_| {
            OidcError::validation(TokenValidationKind::Signature, "unsupported token algorithm")
        })?;

    if !requirements.allowed_algorithms.is_empty()
        && !requirements.allowed_algorithms.contains(&token_algorithm)
    {
        return Err(OidcError::validation(
            TokenValidationKind::Signature,
            format!("token algorithm {token_algorithm:?} is not in the allow-list"),
        ));
    }

    // A provider-declared key algorithm pins the token to it.
    if let Some(key_alg) = key_algorithm
        && key_alg != token_algorithm
    {
        return Err(OidcError::validation(
            TokenValidationKind::Signature,
            "token algorithm does not match the resolved key",
        ));
    }

    let mut validation = Validation::new(token_algorithm);
    validation.leeway = requirements.clock_skew.as_secs();
    validation.validate_exp = requirements.expiry_required;
    validation.validate_aud = false;
    validation.required_spec_claims = if requirements.expiry_required {
        ["exp".to_string()].into_iter().collect()
    } else {
        Default::default()
    };

    let decoded = jsonwebtoken::decode::<Value>(token, key, &validation)
        .map_err(classify_jwt_error)?;
    let claims = decoded.claims;

    check_issuer(&claims, requirements)?;
    check_audience(&claims, requirements)?;
    check_structural_claims(&claims, requirements)?;
    check_required_claims(&claims, &requirements.required_claims)?;
    run_custom_validators(&claims, validators)?;
    check_token_age(&claims, requirements)?;

    Ok(VerifiedClaims { claims })
}

fn classify_jwt_error(err: jsonwebtoken::errors::Error) -> OidcError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => OidcError::expired("token has expired"),
        ErrorKind::InvalidSignature => {
            OidcError::validation(TokenValidationKind::Signature, "signature check failed")
        }
        ErrorKind::InvalidAlgorithm => OidcError::validation(
            TokenValidationKind::Signature,
            "token algorithm rejected",
        ),
        ErrorKind::MissingRequiredClaim(claim) => OidcError::validation(
            TokenValidationKind::MissingClaim,
            format!("required claim {claim} is missing"),
        ),
        _ => OidcError::malformed(format!("token cannot be decoded: {err}")),
    }
}

fn check_issuer(claims: &Value, requirements: &TokenRequirements) -> OidcResult<()> {
    let Some(expected) = &requirements.issuer else {
        return Ok(());
    };
    match claims.get("iss").and_then(|v| v.as_str()) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(OidcError::validation(
            TokenValidationKind::Issuer,
            format!("issuer {actual} does not match expected {expected}"),
        )),
        None => Err(OidcError::validation(
            TokenValidationKind::Issuer,
            "token has no iss claim",
        )),
    }
}

fn check_audience(claims: &Value, requirements: &TokenRequirements) -> OidcResult<()> {
    let expected: &[String] = match &requirements.audience {
        AudienceRequirement::Skip => return Ok(()),
        AudienceRequirement::Exact(values) => values,
        AudienceRequirement::ClientId(client_id) => std::slice::from_ref(client_id),
    };

    let matched = match claims.get("aud") {
        Some(Value::String(aud)) => expected.iter().any(|e| e == aud),
        Some(Value::Array(auds)) => auds
            .iter()
            .filter_map(|v| v.as_str())
            .any(|aud| expected.iter().any(|e| e == aud)),
        _ => false,
    };

    if matched {
        Ok(())
    } else {
        Err(OidcError::validation(
            TokenValidationKind::Audience,
            "token audience does not include an expected value",
        ))
    }
}

fn check_structural_claims(claims: &Value, requirements: &TokenRequirements) -> OidcResult<()> {
    if requirements.subject_required && claims.get("sub").and_then(|v| v.as_str()).is_none() {
        return Err(OidcError::validation(
            TokenValidationKind::Subject,
            "token has no sub claim",
        ));
    }

    if requirements.issued_at_required && claims.get("iat").and_then(|v| v.as_i64()).is_none() {
        return Err(OidcError::validation(
            TokenValidationKind::MissingClaim,
            "required claim iat is missing",
        ));
    }

    if let Some(expected_nonce) = &requirements.nonce {
        match claims.get("nonce").and_then(|v| v.as_str()) {
            Some(actual) if actual == expected_nonce => {}
            _ => {
                return Err(OidcError::validation(
                    TokenValidationKind::Nonce,
                    "token nonce does not match the authorization request",
                ));
            }
        }
    }

    Ok(())
}

fn check_required_claims(
    claims: &Value,
    required: &HashMap<String, Value>,
) -> OidcResult<()> {
    for (name, expected) in required {
        let Some(actual) = claims.get(name) else {
            return Err(OidcError::validation(
                TokenValidationKind::MissingClaim,
                format!("required claim {name} is missing"),
            ));
        };

        let matches = match (actual, expected) {
            (Value::Array(actual_items), Value::Array(expected_items)) => expected_items
                .iter()
                .all(|item| actual_items.contains(item)),
            (Value::Array(actual_items), scalar) => actual_items.contains(scalar),
            (actual_scalar, expected_scalar) => actual_scalar == expected_scalar,
        };

        if !matches {
            return Err(OidcError::validation(
                TokenValidationKind::ClaimMismatch,
                format!("claim {name} does not have the required value"),
            ));
        }
    }
    Ok(())
}

fn run_custom_validators(
    claims: &Value,
    validators: &[Box<dyn ClaimValidator>],
) -> OidcResult<()> {
    for validator in validators {
        if let Err(err) = validator.validate(claims) {
            // Step-up failures keep their ACR payload for the challenge;
            // anything else becomes a generic claim failure.
            if err.required_acr_values().is_some() {
                return Err(err);
            }
            return Err(OidcError::validation(
                TokenValidationKind::ClaimMismatch,
                format!("custom validator rejected token: {err}"),
            ));
        }
    }
    Ok(())
}

/// Re-checks token age after structural validation. This runs even for
/// tokens whose `exp` requirement was skipped: a logout token without the
/// exp requirement must still be absent-or-unexpired and within age bounds.
fn check_token_age(claims: &Value, requirements: &TokenRequirements) -> OidcResult<()> {
    let Some(max_age) = requirements.max_age else {
        return Ok(());
    };
    let Some(iat) = claims.get("iat").and_then(|v| v.as_i64()) else {
        return Ok(());
    };

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let limit = max_age.as_secs() as i64 + requirements.clock_skew.as_secs() as i64;
    if now - iat > limit {
        return Err(OidcError::expired(format!(
            "token was issued {}s ago, over the {limit}s limit",
            now - iat
        )));
    }
    Ok(())
}
