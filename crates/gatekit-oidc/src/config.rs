//! Per-tenant relying-party configuration.
//!
//! A [`TenantConfig`] is parsed from application configuration for static
//! tenants or built programmatically for dynamic ones. It is immutable
//! after construction; the two booleans that can change once provider
//! metadata becomes available (tenant disabled, UserInfo required) live in
//! the tenant context's runtime overrides, never here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{OidcError, OidcResult};

/// The sentinel issuer value disabling the issuer check entirely.
pub const ISSUER_ANY: &str = "any";

/// How the application consumes authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationType {
    /// Bearer-token API; never redirects.
    #[default]
    Service,
    /// Browser application using the authorization-code flow.
    WebApp,
    /// Bearer when an Authorization header is present, code flow otherwise.
    Hybrid,
}

/// Where role claims are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleSource {
    /// The verified ID token.
    IdToken,
    /// The (verified) access token.
    AccessToken,
    /// The UserInfo response.
    UserInfo,
}

/// Preferred token-endpoint client authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientAuthMethod {
    /// `client_secret_basic`.
    Basic,
    /// `client_secret_post`.
    Post,
    /// `client_secret_jwt` — the secret signs a JWT posted to the endpoint.
    PostJwt,
}

/// Client credentials configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CredentialsConfig {
    /// The client secret, when the client is confidential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Preferred method for presenting the secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ClientAuthMethod>,

    /// Path to an externally maintained JWT bearer assertion, reloaded
    /// whenever the file changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_assertion_path: Option<PathBuf>,

    /// Dedicated basic-auth credentials for the introspection endpoint,
    /// taking precedence over every other method there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introspection_basic_auth: Option<BasicAuthConfig>,
}

/// Plain basic-auth credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BasicAuthConfig {
    /// User name.
    pub name: String,
    /// Password.
    pub secret: String,
}

/// Explicit endpoint paths, used when discovery is disabled or to
/// override a discovered value. Relative paths are resolved against the
/// auth-server URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EndpointConfig {
    /// Authorization endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_path: Option<String>,
    /// Token endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
    /// JWKS endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_path: Option<String>,
    /// UserInfo endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info_path: Option<String>,
    /// Token introspection endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introspection_path: Option<String>,
    /// RP-initiated logout (end-session) endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_session_path: Option<String>,
    /// Token revocation endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_path: Option<String>,
}

impl EndpointConfig {
    /// Returns `true` if no endpoint is configured explicitly.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authorization_path.is_none()
            && self.token_path.is_none()
            && self.jwks_path.is_none()
            && self.user_info_path.is_none()
            && self.introspection_path.is_none()
            && self.end_session_path.is_none()
            && self.revocation_path.is_none()
    }
}

/// Token validation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TokenValidationConfig {
    /// Expected issuer; [`ISSUER_ANY`] disables the check; `None` uses the
    /// discovered issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Expected audiences; `None` derives the audience from the client id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<String>>,

    /// Claims that must be present with the given values.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub required_claims: HashMap<String, serde_json::Value>,

    /// Allowed signature algorithms (JOSE names). Empty accepts whatever
    /// the token declares.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signature_algorithms: Vec<String>,

    /// Maximum accepted token age measured from `iat`.
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option")]
    pub max_age: Option<Duration>,

    /// Whether tokens must carry `iat`.
    pub issued_at_required: bool,

    /// Whether tokens must carry `sub`.
    pub subject_required: bool,

    /// Clock-skew grace for expiry and age checks.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Whether a JWT whose key cannot be resolved may fall back to remote
    /// introspection after a forced key refresh.
    pub allow_jwt_introspection: bool,

    /// Whether opaque bearer tokens are sent to remote introspection.
    pub allow_opaque_token_introspection: bool,

    /// Whether an opaque access token may be verified by a successful
    /// UserInfo fetch when no introspection endpoint exists.
    pub verify_access_token_with_user_info: bool,

    /// Whether the code-flow access token is verified in addition to the
    /// ID token.
    pub verify_access_token: bool,

    /// Whether an expired code-flow session triggers a refresh-token
    /// exchange instead of failing.
    pub refresh_expired: bool,

    /// Proactive-refresh window: an identity expiring within this margin
    /// is refreshed even though it is still valid.
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option")]
    pub refresh_token_time_skew: Option<Duration>,

    /// Alternate header carrying the bearer token (default
    /// `Authorization`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,

    /// Scheme expected in the bearer header; `None` with a custom header
    /// means the raw header value is the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_scheme: Option<String>,
}

impl Default for TokenValidationConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            required_claims: HashMap::new(),
            signature_algorithms: Vec::new(),
            max_age: None,
            issued_at_required: false,
            subject_required: false,
            clock_skew: Duration::from_secs(30),
            allow_jwt_introspection: true,
            allow_opaque_token_introspection: true,
            verify_access_token_with_user_info: false,
            verify_access_token: false,
            refresh_expired: false,
            refresh_token_time_skew: None,
            header_name: None,
            authorization_scheme: None,
        }
    }
}

/// Role and permission extraction rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RolesConfig {
    /// Claim paths to read roles from, `/`-separated for nested objects
    /// (e.g. `realm/roles`). When empty, the `groups` claim is used, with
    /// provider-specific fallbacks.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub role_claim_path: Vec<String>,

    /// Separator splitting a string-valued role claim into several roles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_claim_separator: Option<String>,

    /// Which verified JSON document roles are read from. `None` picks the
    /// ID token for code flow and the access token for bearer requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<RoleSource>,
}

/// Token-state cookie policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TokenStateConfig {
    /// Store access/refresh tokens in separate cookies instead of one
    /// concatenated value.
    pub split_tokens: bool,

    /// Encrypt the session cookie payload.
    pub encryption_required: bool,

    /// Encryption secret; when absent, a key is derived from the client
    /// secret or generated per process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_secret: Option<String>,
}

/// Authorization-code-flow behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthenticationConfig {
    /// Scopes requested in addition to `openid`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    /// Redirect path registered with the provider; `None` uses the
    /// request path that triggered the challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,

    /// Restore the original request path and query after the provider
    /// redirects back.
    pub restore_path_after_redirect: bool,

    /// Strip `code`/`state` parameters with a final redirect after the
    /// code was redeemed.
    pub remove_redirect_parameters: bool,

    /// Send a PKCE challenge with the authorization request.
    pub pkce_required: bool,

    /// Send and verify an OIDC nonce.
    pub nonce_required: bool,

    /// Whether the provider must return an ID token. When `false`, a
    /// missing ID token is replaced by an internally signed one.
    pub id_token_required: bool,

    /// Whether identity creation requires a UserInfo fetch.
    pub user_info_required: bool,

    /// Extra lifetime added to the session cookie beyond the token
    /// lifespan.
    #[serde(with = "humantime_serde")]
    pub session_age_extension: Duration,

    /// Redirect automatically (302) or signal SPA clients with a 499
    /// status when `false` and the request looks like an XHR call.
    pub java_script_auto_redirect: bool,

    /// Cookie path attribute.
    pub cookie_path: String,

    /// Cookie domain attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_domain: Option<String>,

    /// Extra suffix appended to every cookie name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_suffix: Option<String>,

    /// Force the `Secure` cookie attribute even on plain HTTP.
    pub cookie_force_secure: bool,

    /// Token-state cookie policy.
    pub token_state: TokenStateConfig,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            redirect_path: None,
            restore_path_after_redirect: true,
            remove_redirect_parameters: true,
            pkce_required: false,
            nonce_required: false,
            id_token_required: true,
            user_info_required: false,
            session_age_extension: Duration::from_secs(300),
            java_script_auto_redirect: true,
            cookie_path: "/".to_string(),
            cookie_domain: None,
            cookie_suffix: None,
            cookie_force_secure: false,
            token_state: TokenStateConfig::default(),
        }
    }
}

/// Back-channel logout behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackchannelConfig {
    /// Path of the exposed back-channel logout endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Logout behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogoutConfig {
    /// Request path that triggers RP-initiated logout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Path the provider redirects to after logging the user out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_logout_path: Option<String>,

    /// Back-channel logout settings.
    pub backchannel: BackchannelConfig,
}

/// Provider connection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectionConfig {
    /// Per-request timeout against the provider.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Total wait for provider metadata during tenant-context creation;
    /// exceeding it leaves the tenant NOT_READY instead of failing startup.
    #[serde(with = "humantime_serde")]
    pub metadata_init_timeout: Duration,

    /// Retries for transport-level connection failures.
    pub transport_retry_count: u32,

    /// Allow plain-HTTP provider endpoints. Testing only.
    pub allow_http: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            metadata_init_timeout: Duration::from_secs(10),
            transport_retry_count: 3,
            allow_http: false,
        }
    }
}

/// JWKS resolution behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct JwksConfig {
    /// Fetch the key set eagerly during tenant-context creation.
    pub resolve_early: bool,

    /// Per-key cache capacity.
    pub cache_size: usize,

    /// Key-set and per-key cache TTL.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Cool-down between refreshes forced by unresolvable keys.
    #[serde(with = "humantime_serde")]
    pub forced_refresh_interval: Duration,

    /// Try every published key when a token carries no key identifier.
    pub try_all: bool,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            resolve_early: true,
            cache_size: 100,
            cache_ttl: Duration::from_secs(600),
            forced_refresh_interval: Duration::from_secs(30),
            try_all: false,
        }
    }
}

/// A tenant: one independently configured relying-party identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TenantConfig {
    /// Unique tenant id; must equal the registry key it is stored under.
    pub tenant_id: String,

    /// Whether this tenant accepts requests.
    pub enabled: bool,

    /// Base URL of the OIDC provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_server_url: Option<Url>,

    /// How this tenant authenticates requests.
    pub application_type: ApplicationType,

    /// OAuth client id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Client credentials.
    pub credentials: CredentialsConfig,

    /// Use `.well-known/openid-configuration` discovery.
    pub discovery_enabled: bool,

    /// Explicit endpoint paths.
    pub endpoints: EndpointConfig,

    /// A static PEM/base64 public key; disables remote key resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// PEM file with certificates trusted for `x5c` chain validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_store_file: Option<PathBuf>,

    /// Request paths served by this tenant, matched by prefix during
    /// tenant resolution.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tenant_paths: Vec<String>,

    /// Token validation rules.
    pub token: TokenValidationConfig,

    /// Role extraction rules.
    pub roles: RolesConfig,

    /// Code-flow behavior.
    pub authentication: AuthenticationConfig,

    /// Logout behavior.
    pub logout: LogoutConfig,

    /// Connection behavior.
    pub connection: ConnectionConfig,

    /// JWKS behavior.
    pub jwks: JwksConfig,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            enabled: true,
            auth_server_url: None,
            application_type: ApplicationType::default(),
            client_id: None,
            credentials: CredentialsConfig::default(),
            discovery_enabled: true,
            endpoints: EndpointConfig::default(),
            public_key: None,
            trust_store_file: None,
            tenant_paths: Vec::new(),
            token: TokenValidationConfig::default(),
            roles: RolesConfig::default(),
            authentication: AuthenticationConfig::default(),
            logout: LogoutConfig::default(),
            connection: ConnectionConfig::default(),
            jwks: JwksConfig::default(),
        }
    }
}

/// The id of the default tenant.
pub const DEFAULT_TENANT_ID: &str = "Default";

impl TenantConfig {
    /// Creates a tenant configuration with the given id.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    /// Sets the provider base URL.
    #[must_use]
    pub fn with_auth_server_url(mut self, url: Url) -> Self {
        self.auth_server_url = Some(url);
        self
    }

    /// Sets the application type.
    #[must_use]
    pub fn with_application_type(mut self, application_type: ApplicationType) -> Self {
        self.application_type = application_type;
        self
    }

    /// Sets the client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.credentials.secret = Some(secret.into());
        self
    }

    /// Disables metadata discovery.
    #[must_use]
    pub fn with_discovery_enabled(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }

    /// Returns `true` for web-app tenants.
    #[must_use]
    pub fn is_web_app(&self) -> bool {
        self.application_type == ApplicationType::WebApp
    }

    /// Returns the issuer check derived from this configuration:
    /// `None` means "check against the discovered issuer", `Some(None)`
    /// means the check is disabled by the [`ISSUER_ANY`] sentinel.
    #[must_use]
    pub fn configured_issuer(&self) -> Option<Option<&str>> {
        match self.token.issuer.as_deref() {
            None => None,
            Some(ISSUER_ANY) => Some(None),
            Some(other) => Some(Some(other)),
        }
    }

    /// Validates property combinations that are fatal at tenant-context
    /// creation, regardless of provider readiness.
    pub fn validate(&self) -> OidcResult<()> {
        if self.tenant_id.is_empty() {
            return Err(OidcError::configuration("tenant id must not be empty"));
        }

        if self.client_id.is_none() && self.public_key.is_none() {
            return Err(OidcError::configuration(format!(
                "tenant {}: client id is required",
                self.tenant_id
            )));
        }

        if self.public_key.is_some() && self.trust_store_file.is_some() {
            return Err(OidcError::configuration(format!(
                "tenant {}: public-key and certificate-chain verification are mutually exclusive",
                self.tenant_id
            )));
        }

        if self.public_key.is_none() && self.auth_server_url.is_none() {
            return Err(OidcError::configuration(format!(
                "tenant {}: auth-server-url is required unless a public key is configured",
                self.tenant_id
            )));
        }

        if self.application_type == ApplicationType::Service
            && (self.authentication.pkce_required || self.logout.path.is_some())
        {
            return Err(OidcError::configuration(format!(
                "tenant {}: code-flow properties are not valid for a service application",
                self.tenant_id
            )));
        }

        Ok(())
    }
}
