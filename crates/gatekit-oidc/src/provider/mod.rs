//! The per-tenant provider facade.
//!
//! A [`Provider`] is a state-free combination of a [`ProviderClient`] and
//! the token verification pipeline, built once per tenant context. Both
//! halves are constructor-injected by the tenant context factory; neither
//! holds a back-pointer to the other.
//!
//! - [`metadata`] - endpoint metadata and discovery
//! - [`client`] - provider endpoint HTTP calls
//! - [`client_auth`] - token-endpoint client authentication

pub mod client;
pub mod client_auth;
pub mod metadata;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jsonwebtoken::Algorithm;
use serde_json::Value;

use crate::config::TenantConfig;
use crate::error::{OidcError, OidcResult};
use crate::token::resolver::KeyResolver;
use crate::token::verifier::{
    self, AudienceRequirement, ClaimValidator, TokenRequirements, VerifiedClaims,
};

pub use client::{
    AuthorizationCodeTokens, IntrospectionResult, ProviderClient, UserInfoPayload,
};
pub use client_auth::{
    AssertionFile, ClientAuthenticator, ClientSecretProvider, EndpointPurpose, RequestCredentials,
};
pub use metadata::{DiscoveryClient, DiscoveryConfig, OidcMetadata};

/// Outcome of one token verification.
///
/// In the common case exactly one side is populated: a JWT yields local
/// claims, an opaque token yields an introspection result. Both are
/// populated when introspection ran as a fallback after local
/// verification could not find a key.
#[derive(Debug, Clone, Default)]
pub struct TokenVerificationResult {
    /// Locally verified claims.
    pub local_claims: Option<VerifiedClaims>,
    /// Remote introspection result.
    pub introspection: Option<IntrospectionResult>,
}

impl TokenVerificationResult {
    /// Wraps locally verified claims.
    #[must_use]
    pub fn from_claims(claims: VerifiedClaims) -> Self {
        Self {
            local_claims: Some(claims),
            ..Self::default()
        }
    }

    /// Wraps an introspection result.
    #[must_use]
    pub fn from_introspection(introspection: IntrospectionResult) -> Self {
        Self {
            introspection: Some(introspection),
            ..Self::default()
        }
    }
}

/// Verified UserInfo claims.
#[derive(Debug, Clone)]
pub struct UserInfo {
    raw: Value,
}

impl UserInfo {
    /// Wraps UserInfo claims.
    #[must_use]
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.raw.get("sub").and_then(|v| v.as_str())
    }

    /// The full claim document.
    #[must_use]
    pub fn claims(&self) -> &Value {
        &self.raw
    }
}

/// State-free per-tenant facade over verification and provider calls.
pub struct Provider {
    tenant_id: String,
    config: Arc<TenantConfig>,
    client: ProviderClient,
    resolver: KeyResolver,
    base_requirements: TokenRequirements,
    validators: Vec<Box<dyn ClaimValidator>>,
    closed: AtomicBool,
}

impl Provider {
    /// Assembles a provider from its constructor-injected parts.
    pub fn new(
        config: Arc<TenantConfig>,
        client: ProviderClient,
        resolver: KeyResolver,
        validators: Vec<Box<dyn ClaimValidator>>,
    ) -> OidcResult<Self> {
        let base_requirements = build_requirements(&config, client.metadata())?;
        Ok(Self {
            tenant_id: config.tenant_id.clone(),
            config,
            client,
            resolver,
            base_requirements,
            validators,
            closed: AtomicBool::new(false),
        })
    }

    /// The tenant this provider serves.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The resolved endpoint metadata.
    #[must_use]
    pub fn metadata(&self) -> &Arc<OidcMetadata> {
        self.client.metadata()
    }

    /// The tenant configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<TenantConfig> {
        &self.config
    }

    /// A copy of the base claim requirements, for callers that need to
    /// adjust a single rule (nonce, audience) per verification.
    #[must_use]
    pub fn requirements(&self) -> TokenRequirements {
        self.base_requirements.clone()
    }

    /// Releases the underlying HTTP client. Idempotent; called once per
    /// tenant-context destruction.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.client.close();
            tracing::debug!("Closed provider for tenant {}", self.tenant_id);
        }
    }

    /// Verifies a JWT against the tenant's key resolver and rules.
    pub async fn verify(
        &self,
        token: &str,
        requirements: &TokenRequirements,
    ) -> OidcResult<VerifiedClaims> {
        verifier::verify(token, &self.resolver, requirements, &self.validators).await
    }

    /// Verifies an internally minted HS256 token.
    pub fn verify_self_signed(
        &self,
        token: &str,
        secret: &[u8],
        requirements: &TokenRequirements,
    ) -> OidcResult<VerifiedClaims> {
        verifier::verify_self_signed(token, secret, requirements)
    }

    /// Verifies a back-channel logout token.
    ///
    /// The structural `exp` requirement is relaxed, but a present `exp`
    /// must still be unexpired, and the token age limit applies.
    pub async fn verify_logout_token(&self, token: &str) -> OidcResult<VerifiedClaims> {
        let mut requirements = self.base_requirements.clone();
        requirements.expiry_required = false;
        requirements.issued_at_required = true;
        requirements.subject_required = false;

        let verified = self.verify(token, &requirements).await?;
        check_optional_expiry(&verified.claims, requirements.clock_skew.as_secs() as i64)?;
        Ok(verified)
    }

    /// Forces a key-set refresh (cool-down bounded) and verifies once.
    pub async fn refresh_jwks_and_verify(
        &self,
        token: &str,
        requirements: &TokenRequirements,
    ) -> OidcResult<VerifiedClaims> {
        self.resolver.force_refresh().await?;
        self.verify(token, requirements).await
    }

    /// The resolve-then-verify pipeline with the unresolvable-key fallback
    /// chain: local verification, one forced-refresh retry, then remote
    /// introspection when the caller allows it.
    pub async fn resolve_key_and_verify(
        &self,
        token: &str,
        requirements: &TokenRequirements,
        allow_introspection_fallback: bool,
    ) -> OidcResult<TokenVerificationResult> {
        let original = match self.verify(token, requirements).await {
            Ok(verified) => return Ok(TokenVerificationResult::from_claims(verified)),
            Err(err) if err.is_unresolvable_key() => err,
            Err(err) => return Err(err),
        };

        if !self.config.token.allow_jwt_introspection {
            return Err(original);
        }

        let refreshed = self.resolver.force_refresh().await.unwrap_or(false);
        if refreshed {
            match self.verify(token, requirements).await {
                Ok(verified) => return Ok(TokenVerificationResult::from_claims(verified)),
                Err(err) if err.is_unresolvable_key() => {}
                Err(err) => return Err(err),
            }
        }

        if allow_introspection_fallback && self.metadata().introspection_endpoint.is_some() {
            tracing::debug!(
                "Falling back to introspection for tenant {} after unresolvable key",
                self.tenant_id
            );
            let introspection = self.introspect(token).await?;
            return Ok(TokenVerificationResult::from_introspection(introspection));
        }

        Err(original)
    }

    /// Introspects a token and validates the response: the `active` flag,
    /// expiry, issued-at age and the tenant's required claims.
    pub async fn introspect(&self, token: &str) -> OidcResult<IntrospectionResult> {
        let result = self.client.introspect(token).await?;
        validate_introspection(
            &result,
            &self.base_requirements,
            time::OffsetDateTime::now_utc().unix_timestamp(),
        )?;
        Ok(result)
    }

    /// Fetches UserInfo, verifying it through the key resolver when the
    /// provider signs it as a JWT — with a one-shot refresh-and-retry on
    /// an unresolvable key.
    pub async fn get_user_info(&self, access_token: &str) -> OidcResult<UserInfo> {
        match self.client.get_user_info(access_token).await? {
            UserInfoPayload::Json(claims) => Ok(UserInfo::new(claims)),
            UserInfoPayload::Jwt(jwt) => {
                let mut requirements = self.base_requirements.clone();
                // Signed UserInfo is not an ID token: no audience or expiry
                // structure is guaranteed.
                requirements.audience = AudienceRequirement::Skip;
                requirements.expiry_required = false;

                let verified = match self.verify(&jwt, &requirements).await {
                    Ok(verified) => verified,
                    Err(err) if err.is_unresolvable_key() => {
                        if !self.resolver.force_refresh().await.unwrap_or(false) {
                            return Err(err);
                        }
                        self.verify(&jwt, &requirements).await?
                    }
                    Err(err) => return Err(err),
                };
                Ok(UserInfo::new(verified.claims))
            }
        }
    }

    /// Exchanges an authorization code for tokens.
    pub async fn get_code_flow_tokens(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> OidcResult<AuthorizationCodeTokens> {
        self.client
            .get_authorization_code_tokens(code, redirect_uri, code_verifier)
            .await
    }

    /// Redeems a refresh token.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> OidcResult<AuthorizationCodeTokens> {
        self.client.refresh_tokens(refresh_token).await
    }

    /// Revokes a token if the provider exposes a revocation endpoint.
    pub async fn revoke(&self, token: &str, type_hint: Option<&str>) -> OidcResult<bool> {
        self.client.revoke(token, type_hint).await
    }
}

/// Derives the base claim requirements from configuration and metadata.
fn build_requirements(
    config: &TenantConfig,
    metadata: &OidcMetadata,
) -> OidcResult<TokenRequirements> {
    let issuer = match config.configured_issuer() {
        // No explicit issuer: check against the discovered one.
        None => metadata.issuer.clone(),
        // The `any` sentinel disables the check.
        Some(None) => None,
        Some(Some(explicit)) => Some(explicit.to_string()),
    };

    let audience = match (&config.token.audience, &config.client_id) {
        (Some(values), _) => AudienceRequirement::Exact(values.clone()),
        (None, Some(client_id)) => AudienceRequirement::ClientId(client_id.clone()),
        (None, None) => AudienceRequirement::Skip,
    };

    let allowed_algorithms = config
        .token
        .signature_algorithms
        .iter()
        .map(|name| {
            name.parse::<Algorithm>().map_err(|_| {
                OidcError::configuration(format!("unknown signature algorithm {name}"))
            })
        })
        .collect::<OidcResult<Vec<_>>>()?;

    Ok(TokenRequirements {
        issuer,
        audience,
        expiry_required: true,
        issued_at_required: config.token.issued_at_required,
        subject_required: config.token.subject_required,
        nonce: None,
        allowed_algorithms,
        required_claims: config.token.required_claims.clone(),
        max_age: config.token.max_age,
        clock_skew: config.token.clock_skew,
    })
}

/// A present `exp` must be unexpired even when the structural requirement
/// was skipped.
fn check_optional_expiry(claims: &Value, leeway: i64) -> OidcResult<()> {
    if let Some(exp) = claims.get("exp").and_then(|v| v.as_i64()) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        if exp + leeway < now {
            return Err(OidcError::expired("logout token has expired"));
        }
    }
    Ok(())
}

/// Applies the tenant's validation rules to an introspection response.
fn validate_introspection(
    result: &IntrospectionResult,
    requirements: &TokenRequirements,
    now: i64,
) -> OidcResult<()> {
    if !result.active() {
        // "Inactive" is its own failure message, distinct from rule
        // violations, so operators can tell revocation from misconfig.
        return Err(OidcError::authentication_failed(
            "token introspection returned an inactive token",
        ));
    }

    let leeway = requirements.clock_skew.as_secs() as i64;
    if let Some(exp) = result.expires_at()
        && exp + leeway < now
    {
        return Err(OidcError::expired("introspected token has expired"));
    }

    if let Some(max_age) = requirements.max_age
        && let Some(iat) = result.issued_at()
        && now - iat > max_age.as_secs() as i64 + leeway
    {
        return Err(OidcError::expired(
            "introspected token exceeds the maximum token age",
        ));
    }

    for (name, expected) in &requirements.required_claims {
        let Some(actual) = result.claims().get(name) else {
            return Err(OidcError::authentication_failed(format!(
                "introspection response is missing required claim {name}"
            )));
        };
        let matches = match (actual, expected) {
            (Value::Array(items), scalar) => items.contains(scalar),
            (scalar, expected) => scalar == expected,
        };
        if !matches {
            return Err(OidcError::authentication_failed(format!(
                "introspection claim {name} does not have the required value"
            )));
        }
    }

    Ok(())
}
