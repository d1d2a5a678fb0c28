//! # gatekit-oidc
//!
//! Multi-tenant OpenID Connect / OAuth2 relying-party core for
//! server-side Rust applications.
//!
//! This crate provides:
//! - Bearer access-token and ID-token validation with JWKS key resolution
//! - The authorization-code flow for browser clients, including PKCE,
//!   nonce and anti-CSRF state handling
//! - Per-tenant provider configuration with discovery and lazy
//!   initialization
//! - Introspection and UserInfo lookups with TTL-bounded caching
//! - Cookie-based session state (split, encrypted and chunked variants)
//! - RP-initiated and back-channel logout
//!
//! ## Overview
//!
//! The HTTP server itself is out of scope: the host adapts its requests
//! into [`exchange::RequestContext`] snapshots, feeds them to the
//! [`engine::AuthenticationEngine`], and applies the returned cookies,
//! redirects and challenges.
//!
//! ## Modules
//!
//! - [`config`] - per-tenant configuration
//! - [`engine`] - the two authentication mechanisms and identity pipeline
//! - [`tenant`] - tenant resolution, contexts and registry
//! - [`provider`] - provider facade, endpoints and client authentication
//! - [`token`] - token inspection, key resolution and verification
//! - [`session`] - cookie-based token state
//! - [`cache`] - the bounded TTL result cache
//! - [`exchange`] - the HTTP exchange boundary
//! - [`error`] - the error taxonomy

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod provider;
pub mod session;
pub mod tenant;
pub mod token;

pub use cache::ResultCache;
pub use config::{
    ApplicationType, ClientAuthMethod, DEFAULT_TENANT_ID, RoleSource, TenantConfig,
    TokenStateConfig,
};
pub use engine::{
    AuthenticationEngine, AuthenticationOutcome, EngineConfig, IdentityAttributes,
    IdentityCredentials, Permission, SecurityIdentity,
};
pub use error::{OidcError, OidcResult, TokenValidationKind};
pub use exchange::{
    BlockingExecutor, ChallengeResponse, NoopEventSink, RequestContext, RequestHandle,
    SecurityEvent, SecurityEventSink,
};
pub use provider::{
    AuthorizationCodeTokens, ClientSecretProvider, IntrospectionResult, OidcMetadata, Provider,
    UserInfo,
};
pub use session::SessionCodec;
pub use tenant::{
    ContextFactory, CustomTenantResolver, TenantConfigContext, TenantRegistry, TenantResolver,
};
pub use token::{KeyResolver, KeySet, TokenRequirements, VerifiedClaims};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use gatekit_oidc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{
        ApplicationType, ClientAuthMethod, DEFAULT_TENANT_ID, RoleSource, TenantConfig,
        TokenStateConfig,
    };
    pub use crate::engine::{
        AuthenticationEngine, AuthenticationOutcome, EngineConfig, Permission, SecurityIdentity,
    };
    pub use crate::error::{OidcError, OidcResult, TokenValidationKind};
    pub use crate::exchange::{
        BlockingExecutor, ChallengeResponse, RequestContext, SecurityEvent, SecurityEventSink,
    };
    pub use crate::provider::{AuthorizationCodeTokens, OidcMetadata, Provider};
    pub use crate::tenant::{ContextFactory, CustomTenantResolver, TenantRegistry};
}
