//! Per-request tenant resolution.
//!
//! Each step short-circuits on the first match, in priority order: the
//! explicit override on the request context, a user-supplied custom
//! resolver, path-prefix matching, issuer-based matching against the
//! presented bearer token, custom-header matching, literal path-segment
//! matching against tenant ids, and finally the default tenant.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::{ApplicationType, TenantConfig};
use crate::error::{OidcError, OidcResult};
use crate::exchange::{RequestContext, extract_bearer};
use crate::tenant::context::TenantConfigContext;
use crate::tenant::registry::TenantRegistry;
use crate::token::codec;

/// A user-supplied resolver producing tenant configurations dynamically.
#[async_trait::async_trait]
pub trait CustomTenantResolver: Send + Sync {
    /// Returns the tenant configuration for a request, or `None` to let
    /// resolution continue down the chain.
    async fn resolve(&self, request: &RequestContext) -> Option<TenantConfig>;
}

/// Resolves which tenant serves an incoming request.
pub struct TenantResolver {
    registry: Arc<TenantRegistry>,
    custom: Option<Arc<dyn CustomTenantResolver>>,
    header_map: HashMap<String, String>,
    header_resolution_disabled: bool,
}

impl TenantResolver {
    /// Creates a resolver over the registry, with an optional custom
    /// resolver consulted right after the per-request override.
    #[must_use]
    pub fn new(
        registry: Arc<TenantRegistry>,
        custom: Option<Arc<dyn CustomTenantResolver>>,
    ) -> Self {
        let (header_map, header_resolution_disabled) = build_header_map(&registry);
        Self {
            registry,
            custom,
            header_map,
            header_resolution_disabled,
        }
    }

    /// Resolves the tenant context for a request.
    pub async fn resolve(&self, request: &RequestContext) -> OidcResult<Arc<TenantConfigContext>> {
        if let Some(tenant_id) = request.tenant_override() {
            return self
                .registry
                .get_or_create_static(tenant_id)
                .await?
                .ok_or_else(|| {
                    OidcError::configuration(format!(
                        "request names unknown tenant {tenant_id}"
                    ))
                });
        }

        if let Some(custom) = &self.custom
            && let Some(config) = custom.resolve(request).await
        {
            tracing::trace!(
                "Custom resolver selected tenant {} for {}",
                config.tenant_id,
                request.path()
            );
            return self.registry.get_or_create_dynamic(config).await;
        }

        if let Some(tenant_id) = self.match_by_path_prefix(request.path()) {
            if let Some(context) = self.registry.get_or_create_static(&tenant_id).await? {
                return Ok(context);
            }
        }

        if let Some(context) = self.match_by_issuer(request).await? {
            return Ok(context);
        }

        if !self.header_resolution_disabled
            && let Some(context) = self.match_by_header(request).await?
        {
            return Ok(context);
        }

        if let Some(context) = self.match_by_path_segment(request.path()).await? {
            return Ok(context);
        }

        self.registry.get_or_create_default().await
    }

    /// Longest configured path prefix wins.
    fn match_by_path_prefix(&self, path: &str) -> Option<String> {
        let mut best: Option<(&str, &str)> = None;
        for (tenant_id, config) in self.registry.static_configs() {
            for prefix in &config.tenant_paths {
                if path_has_prefix(path, prefix)
                    && best.is_none_or(|(_, current)| prefix.len() > current.len())
                {
                    best = Some((tenant_id, prefix));
                }
            }
        }
        best.map(|(tenant_id, _)| tenant_id.to_string())
    }

    /// Matches the unverified `iss` of the presented bearer token against
    /// each enabled non-web-app tenant's discovered issuer, also requiring
    /// the tenant's required claims to match. A NOT_READY tenant gets
    /// exactly one lazy initialization attempt across all requests.
    async fn match_by_issuer(
        &self,
        request: &RequestContext,
    ) -> OidcResult<Option<Arc<TenantConfigContext>>> {
        let Some(token) = extract_bearer(request, "Authorization", Some("Bearer")) else {
            return Ok(None);
        };
        let Some(claims) = codec::decode_claims(&token) else {
            return Ok(None);
        };
        let Some(issuer) = claims.get("iss").and_then(|v| v.as_str()) else {
            return Ok(None);
        };

        for (tenant_id, config) in self.registry.static_configs() {
            if tenant_id == self.registry.default_tenant_id()
                || config.application_type == ApplicationType::WebApp
                || !config.enabled
            {
                continue;
            }

            let Some(context) = self.registry.get_or_create_static(tenant_id).await? else {
                continue;
            };
            if !context.is_enabled() {
                continue;
            }

            if !context.is_ready() && context.take_issuer_retry() {
                // One retry per tenant, shared across concurrent requests.
                if let Err(err) = context
                    .ensure_initialized(self.registry.factory())
                    .await
                {
                    tracing::debug!(
                        "Lazy initialization of tenant {} failed during issuer resolution: {}",
                        tenant_id,
                        err
                    );
                }
            }

            let Some(provider) = context.provider() else {
                continue;
            };
            let Some(tenant_issuer) = provider.metadata().issuer.as_deref() else {
                continue;
            };

            if tenant_issuer.trim_end_matches('/') == issuer.trim_end_matches('/')
                && required_claims_match(&claims, &config.token.required_claims)
            {
                tracing::trace!("Issuer {} resolved tenant {}", issuer, tenant_id);
                return Ok(Some(context));
            }
        }

        Ok(None)
    }

    async fn match_by_header(
        &self,
        request: &RequestContext,
    ) -> OidcResult<Option<Arc<TenantConfigContext>>> {
        for (header_name, tenant_id) in &self.header_map {
            if request.header(header_name).is_some() {
                return self.registry.get_or_create_static(tenant_id).await;
            }
        }
        Ok(None)
    }

    /// A literal path segment equal to a tenant id selects that tenant.
    async fn match_by_path_segment(
        &self,
        path: &str,
    ) -> OidcResult<Option<Arc<TenantConfigContext>>> {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment != self.registry.default_tenant_id()
                && self.registry.static_configs().contains_key(segment)
            {
                return self.registry.get_or_create_static(segment).await;
            }
        }
        Ok(None)
    }
}

/// Collects tenants declaring a custom bearer header. Two tenants claiming
/// the same header disable header resolution entirely.
fn build_header_map(registry: &TenantRegistry) -> (HashMap<String, String>, bool) {
    let mut map: HashMap<String, String> = HashMap::new();
    for (tenant_id, config) in registry.static_configs() {
        let Some(header) = config.token.header_name.as_deref() else {
            continue;
        };
        if header.eq_ignore_ascii_case("Authorization") {
            continue;
        }
        let key = header.to_ascii_lowercase();
        if let Some(existing) = map.get(&key) {
            tracing::warn!(
                "Tenants {} and {} both claim header {}; disabling header-based tenant resolution",
                existing,
                tenant_id,
                header
            );
            return (HashMap::new(), true);
        }
        map.insert(key, tenant_id.clone());
    }
    (map, false)
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn required_claims_match(claims: &Value, required: &HashMap<String, Value>) -> bool {
    required.iter().all(|(name, expected)| {
        claims.get(name).is_some_and(|actual| match (actual, expected) {
            (Value::Array(items), scalar) => items.contains(scalar),
            (actual, expected) => actual == expected,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TENANT_ID;
    use crate::exchange::BlockingExecutor;
    use crate::tenant::registry::ContextFactory;
    use http::Method;
    use url::Url;

    fn local_config(id: &str) -> TenantConfig {
        let mut config = TenantConfig::new(id);
        config.auth_server_url = Some(Url::parse("https://op.example.com").unwrap());
        config.client_id = Some(format!("{id}-client"));
        config.discovery_enabled = false;
        config.endpoints.jwks_path = Some("/jwks".to_string());
        config.jwks.resolve_early = false;
        config
    }

    fn registry(statics: Vec<TenantConfig>) -> Arc<TenantRegistry> {
        Arc::new(
            TenantRegistry::new(
                local_config(DEFAULT_TENANT_ID),
                statics,
                ContextFactory::new(BlockingExecutor::new(2)),
            )
            .unwrap(),
        )
    }

    fn request(path: &str) -> RequestContext {
        RequestContext::builder(Method::GET, path).build()
    }

    #[tokio::test]
    async fn test_default_tenant_when_nothing_matches() {
        let resolver = TenantResolver::new(registry(vec![local_config("a")]), None);
        let context = resolver.resolve(&request("/anything")).await.unwrap();
        assert_eq!(context.tenant_id(), DEFAULT_TENANT_ID);
    }

    #[tokio::test]
    async fn test_override_takes_precedence() {
        let resolver = TenantResolver::new(registry(vec![local_config("a")]), None);
        let request = RequestContext::builder(Method::GET, "/a/api")
            .tenant_override("a")
            .build();
        let context = resolver.resolve(&request).await.unwrap();
        assert_eq!(context.tenant_id(), "a");

        let unknown = RequestContext::builder(Method::GET, "/")
            .tenant_override("ghost")
            .build();
        assert!(resolver.resolve(&unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_resolver_wins_over_path() {
        struct Fixed;
        #[async_trait::async_trait]
        impl CustomTenantResolver for Fixed {
            async fn resolve(&self, _request: &RequestContext) -> Option<TenantConfig> {
                let mut config = TenantConfig::new("dynamic");
                config.auth_server_url =
                    Some(Url::parse("https://op.example.com").unwrap());
                config.client_id = Some("dyn-client".to_string());
                config.discovery_enabled = false;
                config.endpoints.jwks_path = Some("/jwks".to_string());
                config.jwks.resolve_early = false;
                Some(config)
            }
        }

        let mut with_path = local_config("a");
        with_path.tenant_paths = vec!["/a".to_string()];
        let resolver = TenantResolver::new(registry(vec![with_path]), Some(Arc::new(Fixed)));

        let context = resolver.resolve(&request("/a/resource")).await.unwrap();
        assert_eq!(context.tenant_id(), "dynamic");
    }

    #[tokio::test]
    async fn test_path_prefix_longest_match() {
        let mut a = local_config("a");
        a.tenant_paths = vec!["/api".to_string()];
        let mut b = local_config("b");
        b.tenant_paths = vec!["/api/internal".to_string()];

        let resolver = TenantResolver::new(registry(vec![a, b]), None);

        let context = resolver.resolve(&request("/api/internal/x")).await.unwrap();
        assert_eq!(context.tenant_id(), "b");

        let context = resolver.resolve(&request("/api/public")).await.unwrap();
        assert_eq!(context.tenant_id(), "a");

        // Prefixes match on segment boundaries only.
        let context = resolver.resolve(&request("/apiary")).await.unwrap();
        assert_eq!(context.tenant_id(), DEFAULT_TENANT_ID);
    }

    #[tokio::test]
    async fn test_issuer_resolution_picks_matching_tenant() {
        // The tenant's issuer comes from its (statically built) metadata.
        let mut issuer_tenant = local_config("issuer-tenant");
        issuer_tenant.token.issuer = Some("https://op.example.com/realm".to_string());

        let resolver = TenantResolver::new(registry(vec![issuer_tenant]), None);

        let claims = serde_json::json!({"iss": "https://op.example.com/realm", "sub": "s"});
        let token = format!(
            "e30.{}.sig",
            codec::encode_segment(serde_json::to_string(&claims).unwrap().as_bytes())
        );
        let request = RequestContext::builder(Method::GET, "/any")
            .header("Authorization", &format!("Bearer {token}"))
            .build();

        let context = resolver.resolve(&request).await.unwrap();
        assert_eq!(context.tenant_id(), "issuer-tenant");
    }

    #[tokio::test]
    async fn test_issuer_resolution_respects_required_claims() {
        let mut issuer_tenant = local_config("strict");
        issuer_tenant.token.issuer = Some("https://op.example.com/realm".to_string());
        issuer_tenant
            .token
            .required_claims
            .insert("azp".to_string(), serde_json::json!("expected-azp"));

        let resolver = TenantResolver::new(registry(vec![issuer_tenant]), None);

        let claims = serde_json::json!({"iss": "https://op.example.com/realm", "azp": "other"});
        let token = format!(
            "e30.{}.sig",
            codec::encode_segment(serde_json::to_string(&claims).unwrap().as_bytes())
        );
        let request = RequestContext::builder(Method::GET, "/any")
            .header("Authorization", &format!("Bearer {token}"))
            .build();

        let context = resolver.resolve(&request).await.unwrap();
        assert_eq!(context.tenant_id(), DEFAULT_TENANT_ID);
    }

    #[tokio::test]
    async fn test_header_resolution_and_ambiguity() {
        let mut a = local_config("a");
        a.token.header_name = Some("X-Token-A".to_string());
        let resolver = TenantResolver::new(registry(vec![a]), None);

        let request = RequestContext::builder(Method::GET, "/any")
            .header("X-Token-A", "tok")
            .build();
        let context = resolver.resolve(&request).await.unwrap();
        assert_eq!(context.tenant_id(), "a");

        // Two tenants on one header: the resolver is disabled entirely.
        let mut b = local_config("b");
        b.token.header_name = Some("X-Token-A".to_string());
        let mut c = local_config("c");
        c.token.header_name = Some("x-token-a".to_string());
        let ambiguous = TenantResolver::new(registry(vec![b, c]), None);
        assert!(ambiguous.header_resolution_disabled);

        let request = RequestContext::builder(Method::GET, "/any")
            .header("X-Token-A", "tok")
            .build();
        let context = ambiguous.resolve(&request).await.unwrap();
        assert_eq!(context.tenant_id(), DEFAULT_TENANT_ID);
    }

    #[tokio::test]
    async fn test_path_segment_literal_match() {
        let resolver = TenantResolver::new(registry(vec![local_config("hr")]), None);
        let context = resolver.resolve(&request("/service/hr/users")).await.unwrap();
        assert_eq!(context.tenant_id(), "hr");
    }
}
