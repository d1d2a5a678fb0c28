//! Provider endpoint metadata and OIDC discovery.
//!
//! [`OidcMetadata`] is created once per tenant context — either from the
//! `.well-known/openid-configuration` document or from statically
//! configured endpoint paths — and is immutable afterwards; it is replaced
//! only when the whole tenant context is recreated.
//!
//! # Security Considerations
//!
//! - The `issuer` returned by discovery must be identical to the URL the
//!   document was fetched for
//! - Only HTTPS issuers are accepted (configurable for testing)
//! - Responses are size-limited

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{EndpointConfig, TenantConfig};
use crate::error::{OidcError, OidcResult};

/// The provider's discovered or statically configured endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcMetadata {
    /// The issuer identifier.
    pub issuer: Option<String>,

    /// Authorization endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// JWKS endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// UserInfo endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// Token introspection endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// RP-initiated logout endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// Token revocation endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
}

impl OidcMetadata {
    /// Builds metadata from explicitly configured endpoint paths, resolved
    /// against the auth-server URL.
    pub fn from_config(config: &TenantConfig) -> OidcResult<Self> {
        let base = config.auth_server_url.as_ref();
        let resolve = |path: &Option<String>| -> OidcResult<Option<String>> {
            let Some(path) = path else { return Ok(None) };
            if path.starts_with("http://") || path.starts_with("https://") {
                return Ok(Some(path.clone()));
            }
            let base = base.ok_or_else(|| {
                OidcError::configuration(
                    "relative endpoint path requires an auth-server-url",
                )
            })?;
            let joined = join_endpoint(base, path);
            Ok(Some(joined))
        };

        Ok(Self {
            issuer: config
                .token
                .issuer
                .clone()
                .or_else(|| base.map(|u| u.as_str().trim_end_matches('/').to_string())),
            authorization_endpoint: resolve(&config.endpoints.authorization_path)?,
            token_endpoint: resolve(&config.endpoints.token_path)?,
            jwks_uri: resolve(&config.endpoints.jwks_path)?,
            userinfo_endpoint: resolve(&config.endpoints.user_info_path)?,
            introspection_endpoint: resolve(&config.endpoints.introspection_path)?,
            end_session_endpoint: resolve(&config.endpoints.end_session_path)?,
            revocation_endpoint: resolve(&config.endpoints.revocation_path)?,
        })
    }

    /// Overlays explicitly configured endpoints on top of discovered ones.
    #[must_use]
    pub fn overridden_by(mut self, endpoints: &EndpointConfig, base: Option<&Url>) -> Self {
        let resolve = |path: &Option<String>| -> Option<String> {
            let path = path.as_ref()?;
            if path.starts_with("http://") || path.starts_with("https://") {
                return Some(path.clone());
            }
            base.map(|b| join_endpoint(b, path))
        };

        if let Some(v) = resolve(&endpoints.authorization_path) {
            self.authorization_endpoint = Some(v);
        }
        if let Some(v) = resolve(&endpoints.token_path) {
            self.token_endpoint = Some(v);
        }
        if let Some(v) = resolve(&endpoints.jwks_path) {
            self.jwks_uri = Some(v);
        }
        if let Some(v) = resolve(&endpoints.user_info_path) {
            self.userinfo_endpoint = Some(v);
        }
        if let Some(v) = resolve(&endpoints.introspection_path) {
            self.introspection_endpoint = Some(v);
        }
        if let Some(v) = resolve(&endpoints.end_session_path) {
            self.end_session_endpoint = Some(v);
        }
        if let Some(v) = resolve(&endpoints.revocation_path) {
            self.revocation_endpoint = Some(v);
        }
        self
    }
}

fn join_endpoint(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Configuration for the discovery client.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) issuer URLs. Testing only.
    pub allow_http: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

/// Client for fetching `.well-known/openid-configuration` documents.
pub struct DiscoveryClient {
    http_client: reqwest::Client,
    config: DiscoveryConfig,
}

impl DiscoveryClient {
    /// Creates a discovery client sharing the tenant's HTTP client.
    #[must_use]
    pub fn new(http_client: reqwest::Client, config: DiscoveryConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    /// Fetches and validates the discovery document for an issuer URL.
    pub async fn discover(&self, issuer: &Url) -> OidcResult<OidcMetadata> {
        self.validate_scheme(issuer)?;

        let discovery_url = build_discovery_url(issuer);
        tracing::debug!("Fetching OIDC discovery document from {}", discovery_url);

        let response = self
            .http_client
            .get(discovery_url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch OIDC discovery from {}: {}", issuer, e);
                OidcError::transport(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(OidcError::transport(format!(
                "discovery endpoint returned status {}",
                response.status().as_u16()
            )));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(OidcError::transport(format!(
                "discovery response exceeds maximum size of {} bytes",
                self.config.max_response_size
            )));
        }

        let metadata: OidcMetadata = response.json().await.map_err(|e| {
            tracing::warn!("Failed to parse discovery document from {}: {}", issuer, e);
            OidcError::configuration(format!("invalid discovery document: {e}"))
        })?;

        validate_issuer(&metadata, issuer)?;

        tracing::debug!(
            "Discovered OIDC configuration for {}",
            metadata.issuer.as_deref().unwrap_or("<unknown>")
        );
        Ok(metadata)
    }

    fn validate_scheme(&self, issuer: &Url) -> OidcResult<()> {
        let scheme = issuer.scheme();
        if scheme == "https" || (scheme == "http" && self.config.allow_http) {
            Ok(())
        } else {
            Err(OidcError::configuration(format!(
                "issuer URL scheme {scheme} is not allowed"
            )))
        }
    }
}

/// Builds the well-known discovery URL for an issuer.
fn build_discovery_url(issuer: &Url) -> Url {
    let mut discovery_url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    discovery_url.set_path(&format!("{path}/.well-known/openid-configuration"));
    discovery_url.set_query(None);
    discovery_url
}

/// Per OIDC Discovery §4.3, the issuer in the document must be identical
/// to the URL the configuration was retrieved for.
fn validate_issuer(metadata: &OidcMetadata, expected: &Url) -> OidcResult<()> {
    let Some(actual) = metadata.issuer.as_deref() else {
        return Err(OidcError::configuration(
            "discovery document has no issuer",
        ));
    };

    let expected_normalized = expected.as_str().trim_end_matches('/');
    let actual_normalized = actual.trim_end_matches('/');
    if expected_normalized != actual_normalized {
        return Err(OidcError::configuration(format!(
            "discovery issuer mismatch: expected {expected_normalized}, got {actual_normalized}"
        )));
    }
    Ok(())
}
