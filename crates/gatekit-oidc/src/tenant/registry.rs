//! Tenant context creation and caching.
//!
//! The [`ContextFactory`] assembles a [`Provider`] for one tenant:
//! metadata (discovered or static), key resolver, client authenticator and
//! HTTP client. The [`TenantRegistry`] memoizes contexts per tenant id —
//! static tenants in one map, dynamically resolved tenants in another —
//! with get-or-create semantics guaranteeing at most one concurrent
//! construction per tenant; concurrent callers await the in-flight one.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::TenantConfig;
use crate::error::{OidcError, OidcResult};
use crate::exchange::BlockingExecutor;
use crate::provider::{
    ClientAuthenticator, ClientSecretProvider, DiscoveryClient, DiscoveryConfig, OidcMetadata,
    Provider, ProviderClient,
};
use crate::tenant::context::TenantConfigContext;
use crate::token::resolver::{
    CertChainResolver, DynamicKeyResolver, DynamicResolverConfig, KeyResolver, StaticKeyResolver,
};
use crate::token::verifier::ClaimValidator;

/// Produces custom claim validators for a tenant. Registered by the
/// application at startup.
pub type ValidatorFactory =
    dyn Fn(&TenantConfig) -> Vec<Box<dyn ClaimValidator>> + Send + Sync;

/// Builds providers and contexts for tenants.
pub struct ContextFactory {
    executor: BlockingExecutor,
    secret_providers: HashMap<String, Arc<dyn ClientSecretProvider>>,
    validator_factory: Option<Arc<ValidatorFactory>>,
}

impl ContextFactory {
    /// Creates a factory using the given blocking executor for disk and
    /// CPU-bound work.
    #[must_use]
    pub fn new(executor: BlockingExecutor) -> Self {
        Self {
            executor,
            secret_providers: HashMap::new(),
            validator_factory: None,
        }
    }

    /// Registers a rotating-secret provider for a tenant.
    #[must_use]
    pub fn with_secret_provider(
        mut self,
        tenant_id: impl Into<String>,
        provider: Arc<dyn ClientSecretProvider>,
    ) -> Self {
        self.secret_providers.insert(tenant_id.into(), provider);
        self
    }

    /// Registers a factory for custom claim validators.
    #[must_use]
    pub fn with_validator_factory(mut self, factory: Arc<ValidatorFactory>) -> Self {
        self.validator_factory = Some(factory);
        self
    }

    /// Creates a tenant context.
    ///
    /// Configuration problems are fatal. Transport failures and the
    /// metadata timeout degrade the tenant to NOT_READY with a warning;
    /// the real connection attempt is deferred to first use.
    pub async fn create_context(
        &self,
        config: Arc<TenantConfig>,
    ) -> OidcResult<TenantConfigContext> {
        config.validate()?;

        let timeout = config.connection.metadata_init_timeout;
        match tokio::time::timeout(timeout, self.create_provider(Arc::clone(&config))).await {
            Ok(Ok(provider)) => {
                tracing::info!("Tenant {} connected to its provider", config.tenant_id);
                Ok(TenantConfigContext::ready(config, Arc::new(provider)))
            }
            Ok(Err(err)) if err.is_fatal_configuration() => Err(err),
            Ok(Err(err)) => {
                tracing::warn!(
                    "Tenant {} provider is not available ({}); deferring to first use",
                    config.tenant_id,
                    err
                );
                Ok(TenantConfigContext::not_ready(config))
            }
            Err(_) => {
                tracing::warn!(
                    "Tenant {} provider connection timed out after {:?}; deferring to first use",
                    config.tenant_id,
                    timeout
                );
                Ok(TenantConfigContext::not_ready(config))
            }
        }
    }

    /// Builds a provider: metadata, key resolver, client authentication.
    pub async fn create_provider(&self, config: Arc<TenantConfig>) -> OidcResult<Provider> {
        let http = reqwest::Client::builder()
            .timeout(config.connection.request_timeout)
            .build()
            .map_err(|e| OidcError::configuration(format!("cannot create HTTP client: {e}")))?;

        let metadata = Arc::new(self.resolve_metadata(&config, &http).await?);
        let resolver = self.build_resolver(&config, &metadata, &http).await?;

        let token_endpoint = metadata.token_endpoint.clone().unwrap_or_default();
        let authenticator = ClientAuthenticator::new(
            config.client_id.clone().unwrap_or_default(),
            config.credentials.clone(),
            self.secret_providers.get(&config.tenant_id).cloned(),
            token_endpoint,
        );

        let client = ProviderClient::new(
            http,
            Arc::clone(&metadata),
            authenticator,
            config.connection.transport_retry_count,
        );

        let validators = self
            .validator_factory
            .as_ref()
            .map(|factory| factory(&config))
            .unwrap_or_default();

        Provider::new(config, client, resolver, validators)
    }

    async fn resolve_metadata(
        &self,
        config: &TenantConfig,
        http: &reqwest::Client,
    ) -> OidcResult<OidcMetadata> {
        if config.public_key.is_some() || !config.discovery_enabled {
            return OidcMetadata::from_config(config);
        }

        let issuer = config.auth_server_url.clone().ok_or_else(|| {
            OidcError::configuration("discovery requires an auth-server-url")
        })?;
        let discovery = DiscoveryClient::new(
            http.clone(),
            DiscoveryConfig {
                allow_http: config.connection.allow_http,
                ..DiscoveryConfig::default()
            },
        );
        let discovered = discovery.discover(&issuer).await?;
        Ok(discovered.overridden_by(&config.endpoints, Some(&issuer)))
    }

    async fn build_resolver(
        &self,
        config: &TenantConfig,
        metadata: &OidcMetadata,
        http: &reqwest::Client,
    ) -> OidcResult<KeyResolver> {
        if let Some(pem) = &config.public_key {
            return Ok(KeyResolver::Static(StaticKeyResolver::from_pem(pem)?));
        }

        let cert_chain_fallback = match &config.trust_store_file {
            Some(path) => Some(self.load_cert_chain_resolver(path.clone()).await?),
            None => None,
        };

        let jwks_uri = metadata
            .jwks_uri
            .as_deref()
            .ok_or_else(|| {
                OidcError::configuration("no JWKS endpoint is available for token verification")
            })
            .and_then(|uri| {
                Url::parse(uri)
                    .map_err(|e| OidcError::configuration(format!("invalid JWKS URI: {e}")))
            })?;

        let resolver_config = DynamicResolverConfig::new(jwks_uri)
            .with_cache_ttl(config.jwks.cache_ttl)
            .with_cache_max_size(config.jwks.cache_size)
            .with_forced_refresh_interval(config.jwks.forced_refresh_interval)
            .with_try_all_keys(config.jwks.try_all)
            .with_allow_http(config.connection.allow_http);

        let dynamic = DynamicKeyResolver::new(http.clone(), resolver_config, cert_chain_fallback);
        if config.jwks.resolve_early {
            dynamic.prefetch().await?;
        }
        Ok(KeyResolver::Dynamic(dynamic))
    }

    /// Loads the trusted certificates off the async thread.
    async fn load_cert_chain_resolver(
        &self,
        path: std::path::PathBuf,
    ) -> OidcResult<CertChainResolver> {
        let certificates = self
            .executor
            .run(move || -> OidcResult<Vec<Vec<u8>>> {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    OidcError::configuration(format!(
                        "cannot read trust store {}: {e}",
                        path.display()
                    ))
                })?;
                let certificates = parse_pem_certificates(&text);
                if certificates.is_empty() {
                    return Err(OidcError::configuration(format!(
                        "trust store {} contains no certificates",
                        path.display()
                    )));
                }
                Ok(certificates)
            })
            .await??;
        Ok(CertChainResolver::new(&certificates))
    }
}

/// Extracts DER certificates from a PEM bundle.
fn parse_pem_certificates(text: &str) -> Vec<Vec<u8>> {
    let mut certificates = Vec::new();
    let mut body: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            body = Some(String::new());
        } else if line == "-----END CERTIFICATE-----" {
            if let Some(b64) = body.take()
                && let Ok(der) = BASE64_STANDARD.decode(b64)
            {
                certificates.push(der);
            }
        } else if let Some(b64) = body.as_mut() {
            b64.push_str(line);
        }
    }

    certificates
}

type ContextCell = Arc<OnceCell<Arc<TenantConfigContext>>>;

/// Caches tenant contexts per tenant id.
pub struct TenantRegistry {
    factory: ContextFactory,
    default_tenant_id: String,
    static_configs: HashMap<String, Arc<TenantConfig>>,
    static_contexts: DashMap<String, ContextCell>,
    dynamic_contexts: DashMap<String, ContextCell>,
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("default_tenant_id", &self.default_tenant_id)
            .field("static_configs", &self.static_configs.len())
            .field("static_contexts", &self.static_contexts.len())
            .field("dynamic_contexts", &self.dynamic_contexts.len())
            .finish_non_exhaustive()
    }
}

impl TenantRegistry {
    /// Creates a registry over the default tenant and the statically
    /// configured ones.
    ///
    /// # Errors
    ///
    /// Fails when two tenants share an id — the tenant id is the map key
    /// and must be unique.
    pub fn new(
        default_config: TenantConfig,
        static_configs: Vec<TenantConfig>,
        factory: ContextFactory,
    ) -> OidcResult<Self> {
        let default_tenant_id = default_config.tenant_id.clone();
        let mut configs = HashMap::new();
        configs.insert(default_tenant_id.clone(), Arc::new(default_config));

        for config in static_configs {
            let id = config.tenant_id.clone();
            if configs.insert(id.clone(), Arc::new(config)).is_some() {
                return Err(OidcError::configuration(format!(
                    "duplicate tenant id {id}"
                )));
            }
        }

        Ok(Self {
            factory,
            default_tenant_id,
            static_configs: configs,
            static_contexts: DashMap::new(),
            dynamic_contexts: DashMap::new(),
        })
    }

    /// The context factory.
    #[must_use]
    pub fn factory(&self) -> &ContextFactory {
        &self.factory
    }

    /// The default tenant id.
    #[must_use]
    pub fn default_tenant_id(&self) -> &str {
        &self.default_tenant_id
    }

    /// The static tenant configurations, keyed by tenant id.
    #[must_use]
    pub fn static_configs(&self) -> &HashMap<String, Arc<TenantConfig>> {
        &self.static_configs
    }

    /// Eagerly creates every static tenant context.
    ///
    /// Fatal configuration errors fail fast; unreachable providers come
    /// back as NOT_READY contexts and do not stop startup.
    pub async fn initialize_static_tenants(&self) -> OidcResult<()> {
        let ids: Vec<String> = self.static_configs.keys().cloned().collect();
        for id in ids {
            self.get_or_create_static(&id).await?;
        }
        Ok(())
    }

    /// Gets or creates the default tenant's context.
    pub async fn get_or_create_default(&self) -> OidcResult<Arc<TenantConfigContext>> {
        let id = self.default_tenant_id.clone();
        self.get_or_create_static(&id)
            .await?
            .ok_or_else(|| OidcError::configuration("default tenant is not configured"))
    }

    /// Gets or creates a static tenant's context. Unknown ids return
    /// `None` so resolution can continue down its fallback chain.
    pub async fn get_or_create_static(
        &self,
        tenant_id: &str,
    ) -> OidcResult<Option<Arc<TenantConfigContext>>> {
        let Some(config) = self.static_configs.get(tenant_id) else {
            return Ok(None);
        };
        let config = Arc::clone(config);

        let cell: ContextCell = self
            .static_contexts
            .entry(tenant_id.to_string())
            .or_default()
            .clone();

        let context = cell
            .get_or_try_init(|| async {
                self.factory.create_context(config).await.map(Arc::new)
            })
            .await?;
        Ok(Some(Arc::clone(context)))
    }

    /// Gets or creates a context for a dynamically resolved tenant.
    pub async fn get_or_create_dynamic(
        &self,
        config: TenantConfig,
    ) -> OidcResult<Arc<TenantConfigContext>> {
        let tenant_id = config.tenant_id.clone();
        let cell: ContextCell = self
            .dynamic_contexts
            .entry(tenant_id)
            .or_default()
            .clone();

        let context = cell
            .get_or_try_init(|| async {
                self.factory.create_context(Arc::new(config)).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(context))
    }

    /// Every context that has been created so far.
    #[must_use]
    pub fn created_contexts(&self) -> Vec<Arc<TenantConfigContext>> {
        self.static_contexts
            .iter()
            .chain(self.dynamic_contexts.iter())
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    /// Closes every created context. Called at application shutdown.
    pub fn close_all(&self) {
        for context in self.created_contexts() {
            context.close();
        }
        tracing::debug!("Closed all tenant contexts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TENANT_ID;

    fn factory() -> ContextFactory {
        ContextFactory::new(BlockingExecutor::new(2))
    }

    fn default_config() -> TenantConfig {
        let mut config = TenantConfig::default();
        config.auth_server_url = Some(Url::parse("https://op.example.com").unwrap());
        config.client_id = Some("default-client".to_string());
        config.discovery_enabled = false;
        config.endpoints.jwks_path = Some("/jwks".to_string());
        config.jwks.resolve_early = false;
        config
    }

    fn static_config(id: &str) -> TenantConfig {
        let mut config = TenantConfig::new(id);
        config.auth_server_url = Some(Url::parse("https://op.example.com").unwrap());
        config.client_id = Some(format!("{id}-client"));
        // Keep context creation local: no discovery, no early key fetch.
        config.discovery_enabled = false;
        config.endpoints.jwks_path = Some("/jwks".to_string());
        config.jwks.resolve_early = false;
        config
    }

    #[test]
    fn test_duplicate_tenant_ids_rejected() {
        let err = TenantRegistry::new(
            default_config(),
            vec![static_config("a"), static_config("a")],
            factory(),
        )
        .unwrap_err();
        assert!(err.is_fatal_configuration());
    }

    #[tokio::test]
    async fn test_unknown_static_tenant_is_none() {
        let registry = TenantRegistry::new(default_config(), vec![], factory()).unwrap();
        assert!(
            registry
                .get_or_create_static("missing")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_get_or_create_memoizes() {
        let registry =
            TenantRegistry::new(default_config(), vec![static_config("a")], factory()).unwrap();

        let first = registry.get_or_create_static("a").await.unwrap().unwrap();
        let second = registry.get_or_create_static("a").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.created_contexts().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_context() {
        let registry = Arc::new(
            TenantRegistry::new(default_config(), vec![static_config("a")], factory()).unwrap(),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.get_or_create_static("a").await.unwrap().unwrap()
                })
            })
            .collect();

        let mut contexts = Vec::new();
        for task in tasks {
            contexts.push(task.await.unwrap());
        }
        for context in &contexts[1..] {
            assert!(Arc::ptr_eq(&contexts[0], context));
        }
    }

    #[tokio::test]
    async fn test_dynamic_tenant_memoized_separately() {
        let registry = TenantRegistry::new(default_config(), vec![], factory()).unwrap();

        let first = registry
            .get_or_create_dynamic(static_config("dyn"))
            .await
            .unwrap();
        let second = registry
            .get_or_create_dynamic(static_config("dyn"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(
            registry
                .get_or_create_static("dyn")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let mut bad = static_config("bad");
        bad.client_id = None;
        let registry = TenantRegistry::new(default_config(), vec![bad], factory()).unwrap();

        let err = registry.get_or_create_static("bad").await.unwrap_err();
        assert!(err.is_fatal_configuration());
        assert!(registry.initialize_static_tenants().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_provider_degrades_to_not_ready() {
        // Discovery against an unroutable address: transport failure, not
        // a fatal error.
        let mut config = TenantConfig::new("offline");
        config.auth_server_url = Some(Url::parse("https://192.0.2.1").unwrap());
        config.client_id = Some("c".to_string());
        config.connection.metadata_init_timeout = std::time::Duration::from_millis(200);

        let registry = TenantRegistry::new(default_config(), vec![config], factory()).unwrap();
        let context = registry
            .get_or_create_static("offline")
            .await
            .unwrap()
            .unwrap();
        assert!(!context.is_ready());
    }

    #[test]
    fn test_parse_pem_certificates() {
        let pem = "\
-----BEGIN CERTIFICATE-----
AAEC
-----END CERTIFICATE-----
garbage between blocks
-----BEGIN CERTIFICATE-----
AwQF
-----END CERTIFICATE-----
";
        let certs = parse_pem_certificates(pem);
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0], vec![0x00, 0x01, 0x02]);
        assert_eq!(certs[1], vec![0x03, 0x04, 0x05]);
    }

    #[test]
    fn test_default_tenant_id_accessor() {
        let registry = TenantRegistry::new(default_config(), vec![], factory()).unwrap();
        assert_eq!(registry.default_tenant_id(), DEFAULT_TENANT_ID);
    }
}
