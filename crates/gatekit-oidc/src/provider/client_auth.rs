//! Token-endpoint client authentication.
//!
//! One strategy is chosen per request from the configured precedence:
//! introspection-specific basic auth, then `client_secret_basic`, then a
//! JWT bearer assertion supplied by an external file (reloaded when the
//! file changes), then `client_secret_jwt`, then `client_secret_post`,
//! then bare `client_id`.

use std::path::PathBuf;
use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::{ClientAuthMethod, CredentialsConfig};
use crate::error::{OidcError, OidcResult};
use crate::token::verifier::issue_self_signed;

/// Which provider endpoint the credentials are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPurpose {
    /// Token (code exchange / refresh).
    Token,
    /// Token introspection.
    Introspection,
    /// Token revocation.
    Revocation,
}

/// Credentials rendered for one outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestCredentials {
    /// An `Authorization: Basic ...` header value.
    Basic(String),
    /// Form parameters appended to the request body.
    Form(Vec<(String, String)>),
}

/// Source of a rotating client secret.
///
/// When configured, the provider-supplied secret replaces the static one,
/// and a 401 from the provider triggers exactly one re-fetch-and-retry.
#[async_trait::async_trait]
pub trait ClientSecretProvider: Send + Sync {
    /// Fetches the current secret.
    async fn fetch_secret(&self) -> OidcResult<String>;
}

/// A JWT bearer assertion maintained by an external system in a file.
///
/// The content is cached and reloaded whenever the file's modification
/// time changes.
pub struct AssertionFile {
    path: PathBuf,
    cached: Mutex<Option<(SystemTime, String)>>,
}

impl AssertionFile {
    /// Tracks the given assertion file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    /// Returns the current assertion, reloading if the file changed.
    pub async fn current(&self) -> OidcResult<String> {
        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| {
                OidcError::configuration(format!(
                    "cannot stat client assertion file {}: {e}",
                    self.path.display()
                ))
            })?;

        let mut cached = self.cached.lock().await;
        if let Some((cached_mtime, content)) = cached.as_ref()
            && *cached_mtime == modified
        {
            return Ok(content.clone());
        }

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            OidcError::configuration(format!(
                "cannot read client assertion file {}: {e}",
                self.path.display()
            ))
        })?;
        let content = content.trim().to_string();

        tracing::debug!(
            "Reloaded client assertion from {}",
            self.path.display()
        );
        *cached = Some((modified, content.clone()));
        Ok(content)
    }
}

/// Lifetime of self-issued `client_secret_jwt` assertions.
const CLIENT_JWT_LIFETIME_SECS: i64 = 60;

/// Per-tenant client authenticator.
pub struct ClientAuthenticator {
    client_id: String,
    config: CredentialsConfig,
    assertion_file: Option<AssertionFile>,
    secret_provider: Option<std::sync::Arc<dyn ClientSecretProvider>>,
    rotated_secret: Mutex<Option<String>>,
    token_endpoint_audience: String,
}

impl ClientAuthenticator {
    /// Creates an authenticator for a tenant.
    #[must_use]
    pub fn new(
        client_id: String,
        config: CredentialsConfig,
        secret_provider: Option<std::sync::Arc<dyn ClientSecretProvider>>,
        token_endpoint_audience: String,
    ) -> Self {
        let assertion_file = config
            .jwt_assertion_path
            .clone()
            .map(AssertionFile::new);
        Self {
            client_id,
            config,
            assertion_file,
            secret_provider,
            rotated_secret: Mutex::new(None),
            token_endpoint_audience,
        }
    }

    /// Returns `true` if the secret comes from a rotating external
    /// provider, enabling the one-shot 401 retry.
    #[must_use]
    pub fn supports_secret_rotation(&self) -> bool {
        self.secret_provider.is_some()
    }

    /// Drops the cached rotated secret so the next request re-fetches it.
    pub async fn invalidate_rotated_secret(&self) {
        let mut cached = self.rotated_secret.lock().await;
        *cached = None;
        tracing::debug!("Invalidated rotated client secret for {}", self.client_id);
    }

    /// Renders credentials for one request against the given endpoint.
    pub async fn credentials(&self, purpose: EndpointPurpose) -> OidcResult<RequestCredentials> {
        if purpose == EndpointPurpose::Introspection
            && let Some(basic) = &self.config.introspection_basic_auth
        {
            return Ok(basic_header(&basic.name, &basic.secret));
        }

        let secret = self.current_secret().await?;

        if let Some(secret) = &secret
            && matches!(self.config.method, None | Some(ClientAuthMethod::Basic))
        {
            return Ok(basic_header(&self.client_id, secret));
        }

        if let Some(file) = &self.assertion_file {
            let assertion = file.current().await?;
            return Ok(RequestCredentials::Form(vec![
                ("client_id".to_string(), self.client_id.clone()),
                (
                    "client_assertion_type".to_string(),
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
                ),
                ("client_assertion".to_string(), assertion),
            ]));
        }

        if let Some(secret) = &secret {
            if self.config.method == Some(ClientAuthMethod::PostJwt) {
                let assertion = self.sign_client_jwt(secret)?;
                return Ok(RequestCredentials::Form(vec![
                    ("client_id".to_string(), self.client_id.clone()),
                    (
                        "client_assertion_type".to_string(),
                        "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
                    ),
                    ("client_assertion".to_string(), assertion),
                ]));
            }

            return Ok(RequestCredentials::Form(vec![
                ("client_id".to_string(), self.client_id.clone()),
                ("client_secret".to_string(), secret.clone()),
            ]));
        }

        Ok(RequestCredentials::Form(vec![(
            "client_id".to_string(),
            self.client_id.clone(),
        )]))
    }

    async fn current_secret(&self) -> OidcResult<Option<String>> {
        if let Some(provider) = &self.secret_provider {
            let mut cached = self.rotated_secret.lock().await;
            if cached.is_none() {
                *cached = Some(provider.fetch_secret().await?);
            }
            return Ok(cached.clone());
        }
        Ok(self.config.secret.clone())
    }

    /// Signs a `client_secret_jwt` assertion over the token endpoint.
    fn sign_client_jwt(&self, secret: &str) -> OidcResult<String> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = json!({
            "iss": self.client_id,
            "sub": self.client_id,
            "aud": self.token_endpoint_audience,
            "jti": uuid::Uuid::new_v4().to_string(),
            "iat": now,
            "exp": now + CLIENT_JWT_LIFETIME_SECS,
        });
        issue_self_signed(&claims, secret.as_bytes())
    }
}

fn basic_header(name: &str, secret: &str) -> RequestCredentials {
    RequestCredentials::Basic(format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{name}:{secret}"))
    ))
}
