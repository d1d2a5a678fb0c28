//! Immutable per-tenant context.
//!
//! A [`TenantConfigContext`] bundles the tenant configuration, the derived
//! secret keys and — once the provider connection is established — the
//! [`Provider`]. A context created while the provider was unreachable
//! starts NOT_READY: it can still take part in tenant resolution, but the
//! first authentication attempt runs the lazy initializer, upgrading the
//! context in place. At most one initialization runs at a time; concurrent
//! callers await it.
//!
//! The base configuration is never mutated. The two booleans discovered
//! after provider metadata becomes available live in [`RuntimeOverrides`]
//! and are consulted before the static values.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::TenantConfig;
use crate::error::OidcResult;
use crate::provider::Provider;
use crate::tenant::registry::ContextFactory;

/// Keys derived once per tenant context from the configured secrets.
#[derive(Clone)]
pub struct DerivedSecrets {
    /// Key for signing/validating code-flow state values.
    pub state_secret: [u8; 32],
    /// Key for protecting PKCE verifiers stored in the state cookie.
    pub pkce_secret: [u8; 32],
    /// AES-256-GCM key for session cookie encryption.
    pub token_encryption_key: [u8; 32],
    /// HS256 key for internally minted ID tokens.
    pub internal_id_token_secret: [u8; 32],
}

impl DerivedSecrets {
    /// Derives the key set from the tenant's encryption secret or client
    /// secret; a tenant with neither gets a per-process generated base.
    #[must_use]
    pub fn derive(config: &TenantConfig) -> Self {
        let base: Vec<u8> = config
            .authentication
            .token_state
            .encryption_secret
            .as_deref()
            .or(config.credentials.secret.as_deref())
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_else(|| {
                tracing::debug!(
                    "Tenant {} has no secret; generating an encryption key",
                    config.tenant_id
                );
                let mut generated = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut generated);
                generated
            });

        Self {
            state_secret: derive_key(b"state", &base),
            pkce_secret: derive_key(b"pkce", &base),
            token_encryption_key: derive_key(b"token-encryption", &base),
            internal_id_token_secret: derive_key(b"internal-id-token", &base),
        }
    }
}

fn derive_key(purpose: &[u8], base: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(purpose);
    hasher.update(b":");
    hasher.update(base);
    hasher.finalize().into()
}

/// The two derived booleans that may flip after provider metadata becomes
/// available. Layered over the immutable base configuration.
#[derive(Debug, Default)]
pub struct RuntimeOverrides {
    disabled: AtomicBool,
    user_info_required: AtomicBool,
}

impl RuntimeOverrides {
    /// Marks the tenant dynamically disabled.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    /// Whether the tenant was dynamically disabled.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Marks UserInfo as required after metadata discovery.
    pub fn set_user_info_required(&self, required: bool) {
        self.user_info_required.store(required, Ordering::Release);
    }

    /// Whether UserInfo was dynamically marked required.
    #[must_use]
    pub fn user_info_required(&self) -> bool {
        self.user_info_required.load(Ordering::Acquire)
    }
}

/// One tenant's immutable context.
pub struct TenantConfigContext {
    config: Arc<TenantConfig>,
    secrets: DerivedSecrets,
    overrides: RuntimeOverrides,
    provider: ArcSwapOption<Provider>,
    init_lock: tokio::sync::Mutex<()>,
    issuer_retry_available: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for TenantConfigContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConfigContext")
            .field("overrides", &self.overrides)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl TenantConfigContext {
    /// Creates a READY context around an established provider.
    #[must_use]
    pub fn ready(config: Arc<TenantConfig>, provider: Arc<Provider>) -> Self {
        let secrets = DerivedSecrets::derive(&config);
        Self {
            config,
            secrets,
            overrides: RuntimeOverrides::default(),
            provider: ArcSwapOption::from(Some(provider)),
            init_lock: tokio::sync::Mutex::new(()),
            issuer_retry_available: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a NOT_READY context whose provider connection will be
    /// attempted on first use.
    #[must_use]
    pub fn not_ready(config: Arc<TenantConfig>) -> Self {
        let secrets = DerivedSecrets::derive(&config);
        Self {
            config,
            secrets,
            overrides: RuntimeOverrides::default(),
            provider: ArcSwapOption::empty(),
            init_lock: tokio::sync::Mutex::new(()),
            issuer_retry_available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// The tenant configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<TenantConfig> {
        &self.config
    }

    /// The tenant id.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    /// The derived secret keys.
    #[must_use]
    pub fn secrets(&self) -> &DerivedSecrets {
        &self.secrets
    }

    /// The runtime overrides.
    #[must_use]
    pub fn overrides(&self) -> &RuntimeOverrides {
        &self.overrides
    }

    /// Whether the tenant accepts requests, combining static config and
    /// the dynamic override.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.overrides.disabled()
    }

    /// Whether identity creation requires UserInfo, combining static
    /// config and the dynamic override.
    #[must_use]
    pub fn user_info_required(&self) -> bool {
        self.config.authentication.user_info_required || self.overrides.user_info_required()
    }

    /// Whether the provider connection is established.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.provider.load().is_some()
    }

    /// The provider, when READY.
    #[must_use]
    pub fn provider(&self) -> Option<Arc<Provider>> {
        self.provider.load_full()
    }

    /// Returns the provider, running the lazy initializer when NOT_READY.
    ///
    /// Exactly one initialization proceeds at a time; concurrent callers
    /// await it. A failed attempt leaves the context NOT_READY and
    /// surfaces the error to this caller only.
    pub async fn ensure_initialized(&self, factory: &ContextFactory) -> OidcResult<Arc<Provider>> {
        if let Some(provider) = self.provider.load_full() {
            return Ok(provider);
        }

        let _guard = self.init_lock.lock().await;
        // Another caller may have finished while we waited for the lock.
        if let Some(provider) = self.provider.load_full() {
            return Ok(provider);
        }

        tracing::debug!(
            "Initializing NOT_READY tenant {} on first use",
            self.tenant_id()
        );
        let provider = factory.create_provider(Arc::clone(&self.config)).await?;
        let provider = Arc::new(provider);
        self.provider.store(Some(Arc::clone(&provider)));
        tracing::info!("Tenant {} is now ready", self.tenant_id());
        Ok(provider)
    }

    /// One-shot gate for the issuer-resolution lazy retry: the first
    /// caller gets `true`, everyone after gets `false`.
    #[must_use]
    pub fn take_issuer_retry(&self) -> bool {
        self.issuer_retry_available.swap(false, Ordering::AcqRel)
    }

    /// Closes the context, releasing the provider's HTTP client. Safe to
    /// call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel)
            && let Some(provider) = self.provider.load_full()
        {
            provider.close();
        }
    }
}
