//! HTTP client for the OIDC provider's endpoints.
//!
//! Wraps the token, introspection, UserInfo, JWKS and revocation calls.
//! Client authentication is rendered per request by the
//! [`ClientAuthenticator`]; transport-level connection failures are
//! retried up to the configured count, and a 401 with a rotating secret
//! provider triggers exactly one re-fetch-and-retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{OidcError, OidcResult};
use crate::provider::client_auth::{ClientAuthenticator, EndpointPurpose, RequestCredentials};
use crate::provider::metadata::OidcMetadata;
use crate::token::keyset::KeySet;

/// Tokens returned by a code exchange or refresh call.
///
/// Serialized into session cookies; never persisted server-side — the
/// cookie is the only state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizationCodeTokens {
    /// The ID token, if the provider returned one.
    #[serde(default)]
    pub id_token: Option<String>,

    /// The access token.
    #[serde(default)]
    pub access_token: Option<String>,

    /// The refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds, as reported by the provider.
    #[serde(default, rename = "expires_in")]
    pub access_token_expires_in: Option<i64>,

    /// Scope granted to the access token.
    #[serde(default, rename = "scope")]
    pub access_token_scope: Option<String>,
}

/// A token introspection response.
#[derive(Debug, Clone)]
pub struct IntrospectionResult {
    raw: Value,
}

impl IntrospectionResult {
    /// Wraps a raw introspection response.
    #[must_use]
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The `active` flag. An inactive token is an authentication failure.
    #[must_use]
    pub fn active(&self) -> bool {
        self.raw.get("active").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// The `exp` claim, seconds since the epoch.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.raw.get("exp").and_then(|v| v.as_i64())
    }

    /// The `iat` claim, seconds since the epoch.
    #[must_use]
    pub fn issued_at(&self) -> Option<i64> {
        self.raw.get("iat").and_then(|v| v.as_i64())
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.raw.get("sub").and_then(|v| v.as_str())
    }

    /// The `username` member.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.raw.get("username").and_then(|v| v.as_str())
    }

    /// The `scope` member.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.raw.get("scope").and_then(|v| v.as_str())
    }

    /// The full response document.
    #[must_use]
    pub fn claims(&self) -> &Value {
        &self.raw
    }
}

/// A UserInfo response, which providers may return as plain JSON or as a
/// signed JWT that still needs verification.
#[derive(Debug, Clone)]
pub enum UserInfoPayload {
    /// Plain JSON claims.
    Json(Value),
    /// A signed JWT; the caller verifies it through the key resolver.
    Jwt(String),
}

/// OAuth error document returned by provider endpoints.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// HTTP client for one tenant's provider.
pub struct ProviderClient {
    http: reqwest::Client,
    metadata: Arc<OidcMetadata>,
    authenticator: ClientAuthenticator,
    transport_retry_count: u32,
    closed: AtomicBool,
}

impl ProviderClient {
    /// Creates a client over already-resolved provider metadata.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        metadata: Arc<OidcMetadata>,
        authenticator: ClientAuthenticator,
        transport_retry_count: u32,
    ) -> Self {
        Self {
            http,
            metadata,
            authenticator,
            transport_retry_count,
            closed: AtomicBool::new(false),
        }
    }

    /// The provider metadata this client talks to.
    #[must_use]
    pub fn metadata(&self) -> &Arc<OidcMetadata> {
        &self.metadata
    }

    /// Releases the client. Idempotent; subsequent calls fail fast.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Closed provider client");
        }
    }

    fn check_open(&self) -> OidcResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(OidcError::authentication_failed("provider client is closed"))
        } else {
            Ok(())
        }
    }

    /// Fetches and parses the provider's JSON Web Key Set.
    pub async fn get_json_web_key_set(&self) -> OidcResult<KeySet> {
        self.check_open()?;
        let jwks_uri = self
            .metadata
            .jwks_uri
            .as_deref()
            .ok_or_else(|| OidcError::configuration("no JWKS endpoint is configured"))?;

        let response = self
            .send_with_transport_retry(|| self.http.get(jwks_uri).header("Accept", "application/json"))
            .await?;
        let body = self.success_text(response, "JWKS").await?;
        KeySet::from_jwks_json(&body)
    }

    /// Fetches UserInfo for an access token.
    pub async fn get_user_info(&self, access_token: &str) -> OidcResult<UserInfoPayload> {
        self.check_open()?;
        let endpoint = self
            .metadata
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| OidcError::configuration("no UserInfo endpoint is configured"))?;

        let token = access_token.to_string();
        let response = self
            .send_with_transport_retry(|| {
                self.http
                    .get(endpoint)
                    .bearer_auth(&token)
                    .header("Accept", "application/json")
            })
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| OidcError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(self.endpoint_error("UserInfo", status.as_u16(), &body));
        }

        // Some providers sign UserInfo; the caller runs it through the
        // same key resolver as any other token.
        if content_type.contains("application/jwt") || looks_like_jwt(&body) {
            return Ok(UserInfoPayload::Jwt(body.trim().to_string()));
        }

        serde_json::from_str(&body)
            .map(UserInfoPayload::Json)
            .map_err(|e| {
                OidcError::authentication_failed(format!("invalid UserInfo response: {e}"))
            })
    }

    /// Introspects a token.
    pub async fn introspect(&self, token: &str) -> OidcResult<IntrospectionResult> {
        self.check_open()?;
        let endpoint = self
            .metadata
            .introspection_endpoint
            .as_deref()
            .ok_or_else(|| OidcError::configuration("no introspection endpoint is configured"))?;

        let params = vec![("token".to_string(), token.to_string())];
        let body = self
            .post_form(endpoint, EndpointPurpose::Introspection, params, "introspection")
            .await?;

        serde_json::from_str(&body)
            .map(IntrospectionResult::new)
            .map_err(|e| {
                OidcError::authentication_failed(format!("invalid introspection response: {e}"))
            })
    }

    /// Exchanges an authorization code for tokens.
    pub async fn get_authorization_code_tokens(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> OidcResult<AuthorizationCodeTokens> {
        self.check_open()?;
        let mut params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier".to_string(), verifier.to_string()));
        }
        self.token_grant(params).await
    }

    /// Redeems a refresh token.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> OidcResult<AuthorizationCodeTokens> {
        self.check_open()?;
        let params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        self.token_grant(params).await
    }

    /// Revokes a token. Missing revocation endpoint is a no-op reported as
    /// `false`.
    pub async fn revoke(&self, token: &str, type_hint: Option<&str>) -> OidcResult<bool> {
        self.check_open()?;
        let Some(endpoint) = self.metadata.revocation_endpoint.as_deref() else {
            tracing::debug!("No revocation endpoint; skipping token revocation");
            return Ok(false);
        };

        let mut params = vec![("token".to_string(), token.to_string())];
        if let Some(hint) = type_hint {
            params.push(("token_type_hint".to_string(), hint.to_string()));
        }
        self.post_form(endpoint, EndpointPurpose::Revocation, params, "revocation")
            .await?;
        Ok(true)
    }

    async fn token_grant(&self, params: Vec<(String, String)>) -> OidcResult<AuthorizationCodeTokens> {
        let endpoint = self
            .metadata
            .token_endpoint
            .as_deref()
            .ok_or_else(|| OidcError::configuration("no token endpoint is configured"))?;

        let body = self
            .post_form(endpoint, EndpointPurpose::Token, params, "token")
            .await?;
        serde_json::from_str(&body).map_err(|e| {
            OidcError::authentication_failed(format!("invalid token response: {e}"))
        })
    }

    /// Posts a form with client credentials, applying both retry policies.
    async fn post_form(
        &self,
        endpoint: &str,
        purpose: EndpointPurpose,
        params: Vec<(String, String)>,
        what: &str,
    ) -> OidcResult<String> {
        let mut rotated_retry_done = false;

        loop {
            let credentials = self.authenticator.credentials(purpose).await?;
            let mut form = params.clone();
            if let RequestCredentials::Form(auth_params) = &credentials {
                form.extend(auth_params.iter().cloned());
            }

            let response = self
                .send_with_transport_retry(|| {
                    let builder = match &credentials {
                        RequestCredentials::Basic(header) => self
                            .http
                            .post(endpoint)
                            .header(reqwest::header::AUTHORIZATION, header.clone()),
                        RequestCredentials::Form(_) => self.http.post(endpoint),
                    };
                    builder.form(&form)
                })
                .await?;

            let status = response.status();
            if status.as_u16() == 401
                && self.authenticator.supports_secret_rotation()
                && !rotated_retry_done
            {
                // The external secret may have rotated under us: re-fetch
                // and retry exactly once, on 401 only.
                tracing::debug!("{} endpoint returned 401, retrying with re-fetched secret", what);
                self.authenticator.invalidate_rotated_secret().await;
                rotated_retry_done = true;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| OidcError::transport(e.to_string()))?;
            if !status.is_success() {
                return Err(self.endpoint_error(what, status.as_u16(), &body));
            }
            return Ok(body);
        }
    }

    /// Sends a request, retrying transport-level connection failures up to
    /// the configured count. No other error class is retried.
    async fn send_with_transport_retry<F>(&self, build: F) -> OidcResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_connect() && attempt < self.transport_retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        "Connection failure against the provider (attempt {}/{}): {}",
                        attempt,
                        self.transport_retry_count,
                        err
                    );
                }
                Err(err) => return Err(OidcError::transport(err.to_string())),
            }
        }
    }

    async fn success_text(&self, response: reqwest::Response, what: &str) -> OidcResult<String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OidcError::transport(e.to_string()))?;
        if !status.is_success() {
            return Err(self.endpoint_error(what, status.as_u16(), &body));
        }
        Ok(body)
    }

    fn endpoint_error(&self, what: &str, status: u16, body: &str) -> OidcError {
        if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(body) {
            return OidcError::authentication_failed(format!(
                "{what} request failed with {status}: {} {}",
                oauth.error,
                oauth.error_description.unwrap_or_default()
            ));
        }
        OidcError::authentication_failed(format!("{what} request failed with status {status}"))
    }
}

fn looks_like_jwt(body: &str) -> bool {
    let trimmed = body.trim();
    !trimmed.starts_with('{') && trimmed.split('.').count() == 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialsConfig;

    fn client_without_endpoints() -> ProviderClient {
        let metadata = Arc::new(OidcMetadata {
            issuer: Some("https://op.example.com".to_string()),
            authorization_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            userinfo_endpoint: None,
            introspection_endpoint: None,
            end_session_endpoint: None,
            revocation_endpoint: None,
        });
        let authenticator = ClientAuthenticator::new(
            "client-1".to_string(),
            CredentialsConfig::default(),
            None,
            String::new(),
        );
        ProviderClient::new(reqwest::Client::new(), metadata, authenticator, 3)
    }

    #[tokio::test]
    async fn test_missing_endpoints_are_configuration_errors() {
        let client = client_without_endpoints();

        assert!(client.get_json_web_key_set().await.is_err());
        assert!(client.introspect("tok").await.is_err());
        assert!(client.get_user_info("tok").await.is_err());
        assert!(
            client
                .get_authorization_code_tokens("code", "https://app/cb", None)
                .await
                .is_err()
        );
        // Missing revocation endpoint is a no-op, not an error.
        assert!(!client.revoke("tok", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_client_fails_fast() {
        let client = client_without_endpoints();
        client.close();
        client.close(); // idempotent

        let err = client.introspect("tok").await.unwrap_err();
        assert!(matches!(err, OidcError::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_introspection_result_accessors() {
        let result = IntrospectionResult::new(serde_json::json!({
            "active": true,
            "sub": "alice",
            "username": "alice@example.com",
            "scope": "openid profile",
            "exp": 1999999999u32,
        }));
        assert!(result.active());
        assert_eq!(result.subject(), Some("alice"));
        assert_eq!(result.username(), Some("alice@example.com"));
        assert_eq!(result.scope(), Some("openid profile"));

        let inactive = IntrospectionResult::new(serde_json::json!({"active": false}));
        assert!(!inactive.active());
        let missing = IntrospectionResult::new(serde_json::json!({}));
        assert!(!missing.active());
    }

    #[test]
    fn test_token_response_parsing() {
        let tokens: AuthorizationCodeTokens = serde_json::from_str(
            r#"{
                "id_token": "id.jwt.x",
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3600,
                "scope": "openid profile",
                "token_type": "Bearer"
            }"#,
        )
        .unwrap();

        assert_eq!(tokens.id_token.as_deref(), Some("id.jwt.x"));
        assert_eq!(tokens.access_token_expires_in, Some(3600));
        assert_eq!(tokens.access_token_scope.as_deref(), Some("openid profile"));
    }

    #[test]
    fn test_looks_like_jwt() {
        assert!(looks_like_jwt("aaa.bbb.ccc"));
        assert!(!looks_like_jwt("{\"sub\": \"alice\"}"));
        assert!(!looks_like_jwt("opaque"));
    }
}
