//! The authentication engine.
//!
//! Two mechanisms, selected per request by application type and the
//! presence of an Authorization header: Bearer for service APIs and the
//! authorization-code flow for web applications (hybrid tenants take
//! Bearer when the header is present). Both feed the shared
//! identity-building pipeline: verify the primary token (with optional
//! introspection or UserInfo corroboration), extract roles and
//! scope-derived permissions, and assemble the [`SecurityIdentity`].
//!
//! - [`bearer`] - bearer token extraction and 401 challenges
//! - [`code_flow`] - the code-flow state machine
//! - [`backchannel`] - the back-channel logout endpoint
//! - [`identity`] - identities and role extraction

pub mod backchannel;
pub mod bearer;
pub mod code_flow;
pub mod identity;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::cache::ResultCache;
use crate::config::{ApplicationType, RoleSource};
use crate::error::{OidcError, OidcResult};
use crate::exchange::{
    BlockingExecutor, ChallengeResponse, NoopEventSink, RequestContext, SecurityEventSink,
};
use crate::provider::{IntrospectionResult, Provider, TokenVerificationResult};
use crate::tenant::context::TenantConfigContext;
use crate::tenant::registry::TenantRegistry;
use crate::tenant::resolver::{CustomTenantResolver, TenantResolver};
use crate::token::codec;
use crate::token::resolver::TokenHeaders;
use crate::token::verifier::VerifiedClaims;

pub use identity::{
    IdentityAttributes, IdentityCredentials, Permission, SecurityIdentity,
};

/// The result of running authentication for one request.
#[derive(Debug)]
pub enum AuthenticationOutcome {
    /// Authentication succeeded. Any cookies (refreshed or newly
    /// established session state) must be applied to the response.
    Granted {
        /// The authenticated identity.
        identity: SecurityIdentity,
        /// Cookies to set on the response.
        cookies: Vec<cookie::Cookie<'static>>,
    },
    /// No credentials were presented; the request proceeds anonymously or
    /// the caller issues a challenge.
    NoCredentials,
    /// Stop processing and redirect — an expected, frequently taken
    /// branch (restore-path cleanup, RP-initiated logout), not a failure.
    Redirect {
        /// Where to send the client.
        location: Url,
        /// Cookies to set alongside the redirect.
        cookies: Vec<cookie::Cookie<'static>>,
    },
}

/// Internal verdict of the identity pipeline: ready, or valid but inside
/// the proactive-refresh window. Callers translate `NeedsRefresh` into
/// the refresh flow, never into a failure.
pub(crate) enum IdentityVerification {
    Ready(SecurityIdentity),
    NeedsRefresh(SecurityIdentity),
}

/// Engine-wide cache and behavior settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the introspection result cache.
    pub introspection_cache_size: usize,
    /// TTL of cached introspection results.
    pub introspection_cache_ttl: Duration,
    /// Capacity of the UserInfo cache.
    pub user_info_cache_size: usize,
    /// TTL of cached UserInfo documents.
    pub user_info_cache_ttl: Duration,
    /// Capacity of the verified back-channel logout token cache.
    pub logout_token_cache_size: usize,
    /// TTL of verified logout tokens awaiting a matching session.
    pub logout_token_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            introspection_cache_size: 1000,
            introspection_cache_ttl: Duration::from_secs(180),
            user_info_cache_size: 1000,
            user_info_cache_ttl: Duration::from_secs(180),
            logout_token_cache_size: 1000,
            logout_token_cache_ttl: Duration::from_secs(600),
        }
    }
}

/// The authentication engine serving every tenant.
pub struct AuthenticationEngine {
    registry: Arc<TenantRegistry>,
    resolver: TenantResolver,
    introspection_cache: Arc<ResultCache<String, IntrospectionResult>>,
    user_info_cache: Arc<ResultCache<String, Value>>,
    logout_token_cache: Arc<ResultCache<String, Value>>,
    events: Arc<dyn SecurityEventSink>,
    executor: BlockingExecutor,
}

impl AuthenticationEngine {
    /// Creates an engine over a tenant registry.
    #[must_use]
    pub fn new(
        registry: Arc<TenantRegistry>,
        custom_resolver: Option<Arc<dyn CustomTenantResolver>>,
        events: Option<Arc<dyn SecurityEventSink>>,
        executor: BlockingExecutor,
        config: EngineConfig,
    ) -> Self {
        let resolver = TenantResolver::new(Arc::clone(&registry), custom_resolver);
        Self {
            registry,
            resolver,
            introspection_cache: Arc::new(ResultCache::new(
                config.introspection_cache_size,
                config.introspection_cache_ttl,
            )),
            user_info_cache: Arc::new(ResultCache::new(
                config.user_info_cache_size,
                config.user_info_cache_ttl,
            )),
            logout_token_cache: Arc::new(ResultCache::new(
                config.logout_token_cache_size,
                config.logout_token_cache_ttl,
            )),
            events: events.unwrap_or_else(|| Arc::new(NoopEventSink)),
            executor,
        }
    }

    /// The tenant registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// The security event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn SecurityEventSink> {
        &self.events
    }

    /// The bounded blocking executor.
    #[must_use]
    pub fn executor(&self) -> &BlockingExecutor {
        &self.executor
    }

    /// Starts the periodic cache sweeps.
    pub fn start_cache_sweepers(&self, interval: Duration) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.introspection_cache.spawn_sweeper(interval),
            self.user_info_cache.spawn_sweeper(interval),
            self.logout_token_cache.spawn_sweeper(interval),
        ]
    }

    /// Shuts the engine down, closing every tenant context.
    pub fn shutdown(&self) {
        self.registry.close_all();
    }

    /// Authenticates one request.
    pub async fn authenticate(&self, request: &RequestContext) -> OidcResult<AuthenticationOutcome> {
        let context = self.resolver.resolve(request).await?;
        if !context.is_enabled() {
            tracing::debug!("Tenant {} is disabled", context.tenant_id());
            return Ok(AuthenticationOutcome::NoCredentials);
        }

        match self.mechanism(&context, request) {
            Mechanism::Bearer => {
                let Some(token) = bearer::extract_token(request, context.config()) else {
                    return Ok(AuthenticationOutcome::NoCredentials);
                };
                let provider = context
                    .ensure_initialized(self.registry.factory())
                    .await?;
                let verification = self
                    .build_identity(&context, &provider, request, &token, false, None, None)
                    .await?;
                let identity = match verification {
                    IdentityVerification::Ready(identity)
                    | IdentityVerification::NeedsRefresh(identity) => identity,
                };
                Ok(AuthenticationOutcome::Granted {
                    identity,
                    cookies: Vec::new(),
                })
            }
            Mechanism::Code => {
                let provider = context
                    .ensure_initialized(self.registry.factory())
                    .await?;
                code_flow::authenticate(self, &context, &provider, request).await
            }
        }
    }

    /// Builds the challenge for an unauthenticated (or failed) request:
    /// 401 for Bearer, a provider redirect or the 499 SPA signal for the
    /// code flow.
    pub async fn challenge(
        &self,
        request: &RequestContext,
        error: Option<&OidcError>,
    ) -> OidcResult<ChallengeResponse> {
        let context = self.resolver.resolve(request).await?;
        match self.mechanism(&context, request) {
            Mechanism::Bearer => Ok(bearer::challenge(context.config(), error)),
            Mechanism::Code => {
                let provider = context
                    .ensure_initialized(self.registry.factory())
                    .await?;
                code_flow::challenge(&context, &provider, request)
            }
        }
    }

    fn mechanism(&self, context: &TenantConfigContext, request: &RequestContext) -> Mechanism {
        match context.config().application_type {
            ApplicationType::Service => Mechanism::Bearer,
            ApplicationType::WebApp => Mechanism::Code,
            ApplicationType::Hybrid => {
                if bearer::extract_token(request, context.config()).is_some() {
                    Mechanism::Bearer
                } else {
                    Mechanism::Code
                }
            }
        }
    }

    /// The shared identity-building pipeline.
    ///
    /// `primary_is_id_token` selects the code-flow shape (ID token plus
    /// session tokens) over the bearer shape (bare access token). The
    /// access token is verified at most once, and UserInfo is fetched at
    /// most once, however the pipeline recurses.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn build_identity(
        &self,
        context: &Arc<TenantConfigContext>,
        provider: &Arc<Provider>,
        request: &RequestContext,
        primary_token: &str,
        primary_is_id_token: bool,
        tokens: Option<&crate::provider::AuthorizationCodeTokens>,
        nonce: Option<String>,
    ) -> OidcResult<IdentityVerification> {
        let config = context.config();
        let tenant_id = context.tenant_id().to_string();
        let user_info_required = context.user_info_required();
        let access_token: Option<String> = if primary_is_id_token {
            tokens.and_then(|t| t.access_token.clone())
        } else {
            Some(primary_token.to_string())
        };

        let mut verification = TokenVerificationResult::default();
        let mut user_info: Option<Value> = None;
        let mut access_claims: Option<Value> = None;

        if primary_is_id_token {
            verification.local_claims = Some(
                self.verify_id_token(context, provider, primary_token, nonce)
                    .await?,
            );

            if user_info_required {
                let at = access_token.as_deref().ok_or_else(|| {
                    OidcError::authentication_failed(
                        "UserInfo is required but the session has no access token",
                    )
                })?;
                user_info = Some(self.fetch_user_info(&tenant_id, provider, at).await?);
            }

            if config.token.verify_access_token
                || config.roles.source == Some(RoleSource::AccessToken)
            {
                access_claims = self
                    .verify_access_token(&tenant_id, provider, access_token.as_deref())
                    .await?;
            }
        } else if codec::is_opaque(primary_token) {
            let has_introspection = provider.metadata().introspection_endpoint.is_some();
            if user_info_required
                && config.token.verify_access_token_with_user_info
                && !has_introspection
            {
                // No introspection endpoint exists: a successful UserInfo
                // fetch stands in as verification for the opaque token.
                user_info = Some(
                    self.fetch_user_info(&tenant_id, provider, primary_token)
                        .await?,
                );
            } else if config.token.allow_opaque_token_introspection && has_introspection {
                let introspection = self
                    .introspect_cached(&tenant_id, provider, primary_token)
                    .await?;
                verification.introspection = Some(introspection);
                if user_info_required {
                    user_info = Some(
                        self.fetch_user_info(&tenant_id, provider, primary_token)
                            .await?,
                    );
                }
            } else {
                return Err(OidcError::authentication_failed(
                    "opaque bearer token cannot be verified for this tenant",
                ));
            }
        } else {
            let requirements = provider.requirements();
            verification = provider
                .resolve_key_and_verify(
                    primary_token,
                    &requirements,
                    config.token.allow_jwt_introspection,
                )
                .await?;
            if user_info_required {
                user_info = Some(
                    self.fetch_user_info(&tenant_id, provider, primary_token)
                        .await?,
                );
            }
        }

        // UserInfo corroboration: when both documents name a subject they
        // must agree.
        if user_info_required
            && let (Some(claims), Some(info)) = (&verification.local_claims, &user_info)
            && let (Some(token_sub), Some(info_sub)) = (
                claims.subject(),
                info.get("sub").and_then(|v| v.as_str()),
            )
            && token_sub != info_sub
        {
            return Err(OidcError::authentication_failed(
                "UserInfo subject does not match the token subject",
            ));
        }

        let identity = self.assemble_identity(
            context,
            provider,
            request,
            verification,
            user_info,
            access_claims,
            access_token,
            primary_is_id_token.then(|| primary_token.to_string()),
            tokens,
        );

        // Proactive refresh: a still-valid identity expiring inside the
        // configured window is refreshed before it goes stale.
        if primary_is_id_token
            && let Some(window) = config.token.refresh_token_time_skew
            && tokens.and_then(|t| t.refresh_token.as_deref()).is_some()
            && let Some(expires_at) = identity.attributes.expires_at
        {
            let now = time::OffsetDateTime::now_utc().unix_timestamp();
            if expires_at - now <= window.as_secs() as i64 {
                tracing::debug!(
                    "Identity for tenant {} is inside the refresh window",
                    identity.attributes.tenant_id
                );
                return Ok(IdentityVerification::NeedsRefresh(identity));
            }
        }

        Ok(IdentityVerification::Ready(identity))
    }

    async fn verify_id_token(
        &self,
        context: &Arc<TenantConfigContext>,
        provider: &Arc<Provider>,
        id_token: &str,
        nonce: Option<String>,
    ) -> OidcResult<VerifiedClaims> {
        let mut requirements = provider.requirements();
        requirements.nonce = nonce;
        requirements.subject_required = true;

        let headers = TokenHeaders::from_token(id_token)?;
        if headers.algorithm() == Some("HS256") {
            // Internally minted ID tokens are self-signed with the derived
            // tenant key. They never carry the provider's issuer or the
            // authorization-request nonce.
            requirements.issuer = None;
            requirements.nonce = None;
            provider.verify_self_signed(
                id_token,
                &context.secrets().internal_id_token_secret,
                &requirements,
            )
        } else {
            provider.verify(id_token, &requirements).await
        }
    }

    /// Verifies the code-flow access token when configuration demands it,
    /// returning its claims for role extraction. Never triggers a second
    /// UserInfo round.
    async fn verify_access_token(
        &self,
        tenant_id: &str,
        provider: &Arc<Provider>,
        access_token: Option<&str>,
    ) -> OidcResult<Option<Value>> {
        let Some(access_token) = access_token else {
            return Ok(None);
        };

        if codec::is_opaque(access_token) {
            if provider.metadata().introspection_endpoint.is_none() {
                return Ok(None);
            }
            let introspection = self
                .introspect_cached(tenant_id, provider, access_token)
                .await?;
            return Ok(Some(introspection.claims().clone()));
        }

        let requirements = provider.requirements();
        let result = provider
            .resolve_key_and_verify(access_token, &requirements, true)
            .await?;
        Ok(result
            .local_claims
            .map(|c| c.claims)
            .or_else(|| result.introspection.map(|i| i.claims().clone())))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_identity(
        &self,
        context: &Arc<TenantConfigContext>,
        provider: &Arc<Provider>,
        request: &RequestContext,
        verification: TokenVerificationResult,
        user_info: Option<Value>,
        access_claims: Option<Value>,
        access_token: Option<String>,
        id_token: Option<String>,
        tokens: Option<&crate::provider::AuthorizationCodeTokens>,
    ) -> SecurityIdentity {
        let config = context.config();

        let claims: Value = verification
            .local_claims
            .as_ref()
            .map(|c| c.claims.clone())
            .or_else(|| verification.introspection.as_ref().map(|i| i.claims().clone()))
            .or_else(|| user_info.clone())
            .unwrap_or(Value::Null);

        let roles_source: &Value = match config.roles.source {
            Some(RoleSource::UserInfo) => user_info.as_ref().unwrap_or(&claims),
            Some(RoleSource::AccessToken) => access_claims.as_ref().unwrap_or(&claims),
            Some(RoleSource::IdToken) | None => &claims,
        };
        let roles = identity::extract_roles(
            roles_source,
            &config.roles,
            config.client_id.as_deref(),
        );

        let scope = claims
            .get("scope")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| {
                verification
                    .introspection
                    .as_ref()
                    .and_then(|i| i.scope().map(String::from))
            })
            .or_else(|| tokens.and_then(|t| t.access_token_scope.clone()));
        let permissions = identity::permissions_from_scope(scope.as_deref());

        let expires_at = verification
            .local_claims
            .as_ref()
            .and_then(|c| c.expires_at())
            .or_else(|| {
                verification
                    .introspection
                    .as_ref()
                    .and_then(|i| i.expires_at())
            });

        let mut principal = identity::principal_name(&claims);
        if principal.is_empty()
            && let Some(info) = &user_info
        {
            principal = identity::principal_name(info);
        }

        SecurityIdentity {
            principal,
            roles,
            permissions,
            attributes: IdentityAttributes {
                tenant_id: context.tenant_id().to_string(),
                user_info,
                introspection: verification
                    .introspection
                    .as_ref()
                    .map(|i| i.claims().clone()),
                metadata: Arc::clone(provider.metadata()),
                request: request.handle(),
                expires_at,
            },
            credentials: IdentityCredentials {
                access_token,
                id_token,
                refresh_token: tokens.and_then(|t| t.refresh_token.clone()),
            },
            claims,
        }
    }

    /// Introspects through the shared result cache: one remote call per
    /// token per TTL window.
    pub(crate) async fn introspect_cached(
        &self,
        tenant_id: &str,
        provider: &Arc<Provider>,
        token: &str,
    ) -> OidcResult<IntrospectionResult> {
        let key = format!("{tenant_id}:{token}");
        if let Some(cached) = self.introspection_cache.get(&key) {
            tracing::trace!("Introspection cache hit for tenant {}", tenant_id);
            return Ok(cached);
        }

        let result = provider.introspect(token).await?;
        self.introspection_cache.insert(key, result.clone());
        Ok(result)
    }

    /// Fetches UserInfo through the shared result cache.
    pub(crate) async fn fetch_user_info(
        &self,
        tenant_id: &str,
        provider: &Arc<Provider>,
        access_token: &str,
    ) -> OidcResult<Value> {
        let key = format!("{tenant_id}:{access_token}");
        if let Some(cached) = self.user_info_cache.get(&key) {
            tracing::trace!("UserInfo cache hit for tenant {}", tenant_id);
            return Ok(cached);
        }

        let info = provider.get_user_info(access_token).await?;
        let claims = info.claims().clone();
        self.user_info_cache.insert(key, claims.clone());
        Ok(claims)
    }

    /// Records a verified back-channel logout token, keyed by the `sid`
    /// and `sub` it names.
    pub(crate) fn record_backchannel_logout(&self, tenant_id: &str, claims: &Value) {
        for key_claim in ["sid", "sub"] {
            if let Some(value) = claims.get(key_claim).and_then(|v| v.as_str()) {
                self.logout_token_cache.insert(
                    logout_token_key(tenant_id, key_claim, value),
                    claims.clone(),
                );
            }
        }
    }

    /// Returns `true` if a pending logout token targets the claims.
    #[must_use]
    pub fn backchannel_logout_pending(&self, tenant_id: &str, claims: &Value) -> bool {
        ["sid", "sub"].iter().any(|key_claim| {
            claims
                .get(*key_claim)
                .and_then(|v| v.as_str())
                .is_some_and(|value| {
                    self.logout_token_cache
                        .contains(&logout_token_key(tenant_id, key_claim, value))
                })
        })
    }

    /// Consumes a pending logout token matching the claims, so it cannot
    /// be replayed against a later session.
    pub(crate) fn consume_backchannel_logout(&self, tenant_id: &str, claims: &Value) -> bool {
        let mut consumed = false;
        for key_claim in ["sid", "sub"] {
            if let Some(value) = claims.get(key_claim).and_then(|v| v.as_str())
                && self
                    .logout_token_cache
                    .remove(&logout_token_key(tenant_id, key_claim, value))
                    .is_some()
            {
                consumed = true;
            }
        }
        consumed
    }
}

enum Mechanism {
    Bearer,
    Code,
}

fn logout_token_key(tenant_id: &str, claim: &str, value: &str) -> String {
    format!("{tenant_id}:{claim}:{value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;
    use crate::tenant::registry::ContextFactory;
    use http::Method;

    fn engine(statics: Vec<TenantConfig>) -> AuthenticationEngine {
        let mut default_config = TenantConfig::default();
        default_config.auth_server_url = Some(Url::parse("https://op.example.com").unwrap());
        default_config.client_id = Some("default-client".to_string());
        default_config.discovery_enabled = false;
        default_config.endpoints.jwks_path = Some("/jwks".to_string());
        default_config.jwks.resolve_early = false;

        let registry = Arc::new(
            TenantRegistry::new(
                default_config,
                statics,
                ContextFactory::new(BlockingExecutor::new(2)),
            )
            .unwrap(),
        );
        AuthenticationEngine::new(
            registry,
            None,
            None,
            BlockingExecutor::new(2),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_bearer_without_header_is_anonymous() {
        let engine = engine(vec![]);
        let request = RequestContext::builder(Method::GET, "/api").build();
        let outcome = engine.authenticate(&request).await.unwrap();
        assert!(matches!(outcome, AuthenticationOutcome::NoCredentials));
    }

    #[tokio::test]
    async fn test_disabled_tenant_is_anonymous() {
        let mut disabled = TenantConfig::new("off");
        disabled.enabled = false;
        disabled.auth_server_url = Some(Url::parse("https://op.example.com").unwrap());
        disabled.client_id = Some("c".to_string());
        disabled.discovery_enabled = false;
        disabled.endpoints.jwks_path = Some("/jwks".to_string());
        disabled.jwks.resolve_early = false;
        disabled.tenant_paths = vec!["/off".to_string()];

        let engine = engine(vec![disabled]);
        let request = RequestContext::builder(Method::GET, "/off/api")
            .header("Authorization", "Bearer tok")
            .build();
        let outcome = engine.authenticate(&request).await.unwrap();
        assert!(matches!(outcome, AuthenticationOutcome::NoCredentials));
    }

    #[tokio::test]
    async fn test_bearer_challenge_for_service_tenant() {
        let engine = engine(vec![]);
        let request = RequestContext::builder(Method::GET, "/api").build();
        let challenge = engine.challenge(&request, None).await.unwrap();
        assert_eq!(challenge.status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(challenge.headers[0].1, "Bearer");
    }

    #[test]
    fn test_backchannel_logout_record_and_consume() {
        let engine = engine(vec![]);
        let claims = serde_json::json!({"sub": "alice", "sid": "session-1"});

        engine.record_backchannel_logout("t1", &claims);
        assert!(engine.backchannel_logout_pending("t1", &claims));
        assert!(!engine.backchannel_logout_pending("t2", &claims));

        // Matching by sid alone is enough.
        let sid_only = serde_json::json!({"sid": "session-1"});
        assert!(engine.backchannel_logout_pending("t1", &sid_only));

        assert!(engine.consume_backchannel_logout("t1", &claims));
        // Consumed: a later lookup finds nothing to replay.
        assert!(!engine.backchannel_logout_pending("t1", &claims));
        assert!(!engine.consume_backchannel_logout("t1", &claims));
    }
}
