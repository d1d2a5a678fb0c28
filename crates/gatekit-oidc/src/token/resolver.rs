//! Verification-key resolution.
//!
//! One capability, three variants: a static key configured up front, an
//! X.509 certificate-chain resolver backed by a truststore, and a dynamic
//! resolver that fetches and caches the provider's JWKS. Variants compose
//! by delegation — the dynamic resolver may hold a cert-chain fallback —
//! rather than by inheritance.
//!
//! # Security Considerations
//!
//! - Only HTTPS JWKS endpoints are allowed (configurable for testing)
//! - JWKS responses are size-limited
//! - Forced refreshes triggered by "key not found" honor a cool-down so a
//!   flood of unknown-kid tokens cannot turn into a remote-fetch storm

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use jsonwebtoken::DecodingKey;
use sha2::{Digest, Sha256};
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;

use crate::cache::ResultCache;
use crate::error::{OidcError, OidcResult};
use crate::token::codec::{self, encode_segment};
use crate::token::keyset::{KeySet, KeyType, VerificationKey};

/// Parsed, unverified JOSE headers of a token.
#[derive(Debug, Clone)]
pub struct TokenHeaders {
    raw: serde_json::Value,
}

impl TokenHeaders {
    /// Decodes the header segment of a compact JWT.
    pub fn from_token(token: &str) -> OidcResult<Self> {
        Ok(Self {
            raw: codec::decode_header(token)?,
        })
    }

    /// Wraps an already-decoded header object.
    #[must_use]
    pub fn new(raw: serde_json::Value) -> Self {
        Self { raw }
    }

    /// The `kid` header.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.raw.get("kid").and_then(|v| v.as_str())
    }

    /// The `x5t` (SHA-1 certificate thumbprint) header.
    #[must_use]
    pub fn thumbprint(&self) -> Option<&str> {
        self.raw.get("x5t").and_then(|v| v.as_str())
    }

    /// The `x5t#S256` (SHA-256 certificate thumbprint) header.
    #[must_use]
    pub fn s256_thumbprint(&self) -> Option<&str> {
        self.raw.get("x5t#S256").and_then(|v| v.as_str())
    }

    /// The `x5c` certificate chain, base64 DER per RFC 7515.
    #[must_use]
    pub fn certificate_chain(&self) -> Option<Vec<&str>> {
        let chain = self.raw.get("x5c")?.as_array()?;
        let entries: Vec<&str> = chain.iter().filter_map(|v| v.as_str()).collect();
        if entries.is_empty() { None } else { Some(entries) }
    }

    /// The `alg` header.
    #[must_use]
    pub fn algorithm(&self) -> Option<&str> {
        self.raw.get("alg").and_then(|v| v.as_str())
    }

    /// The key type implied by the `alg` header, used to type-check the
    /// keyless fallback.
    #[must_use]
    pub fn key_type(&self) -> Option<KeyType> {
        match self.algorithm()? {
            alg if alg.starts_with("RS") || alg.starts_with("PS") => Some(KeyType::Rsa),
            alg if alg.starts_with("ES") => Some(KeyType::Ec),
            "EdDSA" => Some(KeyType::Okp),
            _ => None,
        }
    }

    /// Returns `true` if any of `kid`, `x5t#S256` or `x5t` is present.
    #[must_use]
    pub fn has_key_identifier(&self) -> bool {
        self.key_id().is_some() || self.s256_thumbprint().is_some() || self.thumbprint().is_some()
    }
}

/// The result of key resolution.
///
/// Most resolutions pin a single key. When the dynamic resolver is
/// configured to try every published key, the verifier attempts each in
/// turn until a signature matches.
pub enum ResolvedKey {
    /// Exactly one candidate key.
    Single(Arc<VerificationKey>),
    /// Try each key until one verifies.
    TryAll(Vec<Arc<VerificationKey>>),
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedKey::Single(_) => f.debug_tuple("Single").finish(),
            ResolvedKey::TryAll(keys) => {
                f.debug_tuple("TryAll").field(&keys.len()).finish()
            }
        }
    }
}

/// Resolver backed by a single configured public key.
pub struct StaticKeyResolver {
    key: Arc<VerificationKey>,
}

impl StaticKeyResolver {
    /// Wraps an existing verification key.
    #[must_use]
    pub fn new(key: VerificationKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Parses a PEM-encoded or bare-base64 SPKI public key.
    pub fn from_pem(data: &str) -> OidcResult<Self> {
        let pem = if data.contains("-----BEGIN") {
            data.to_string()
        } else {
            // Bare base64 key material: wrap it into a PEM envelope.
            let body: String = data.split_whitespace().collect();
            format!("-----BEGIN PUBLIC KEY-----\n{body}\n-----END PUBLIC KEY-----\n")
        };

        let (decoding_key, key_type) = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map(|k| (k, KeyType::Rsa))
            .or_else(|_| DecodingKey::from_ec_pem(pem.as_bytes()).map(|k| (k, KeyType::Ec)))
            .or_else(|_| DecodingKey::from_ed_pem(pem.as_bytes()).map(|k| (k, KeyType::Okp)))
            .map_err(|e| {
                OidcError::configuration(format!("cannot parse configured public key: {e}"))
            })?;

        Ok(Self::new(VerificationKey {
            key_id: None,
            decoding_key,
            algorithm: None,
            key_type,
        }))
    }

    /// Returns the configured key, ignoring the token headers.
    #[must_use]
    pub fn resolve(&self) -> Arc<VerificationKey> {
        Arc::clone(&self.key)
    }
}

/// Resolver validating the token's embedded `x5c` chain against a
/// truststore of trusted certificates.
pub struct CertChainResolver {
    trusted_thumbprints: HashSet<String>,
}

impl CertChainResolver {
    /// Builds a resolver trusting the given DER certificates.
    #[must_use]
    pub fn new(trusted_certificates_der: &[Vec<u8>]) -> Self {
        let trusted_thumbprints = trusted_certificates_der
            .iter()
            .map(|der| encode_segment(&Sha256::digest(der)))
            .collect();
        Self {
            trusted_thumbprints,
        }
    }

    /// Resolves the leaf certificate's public key from the `x5c` header.
    ///
    /// The leaf thumbprint must be in the trusted set, and the chain must
    /// validate: every certificate is verified against its issuer, and a
    /// single-certificate chain must verify its own signature.
    pub fn resolve(&self, headers: &TokenHeaders) -> OidcResult<Arc<VerificationKey>> {
        let chain_b64 = headers
            .certificate_chain()
            .ok_or_else(|| OidcError::unresolvable_key("token has no x5c certificate chain"))?;

        let chain_der: Vec<Vec<u8>> = chain_b64
            .iter()
            .map(|entry| {
                BASE64_STANDARD.decode(entry).map_err(|e| {
                    OidcError::unresolvable_key(format!("invalid x5c certificate encoding: {e}"))
                })
            })
            .collect::<OidcResult<_>>()?;

        let certs: Vec<X509Certificate<'_>> = chain_der
            .iter()
            .map(|der| {
                X509Certificate::from_der(der).map(|(_, cert)| cert).map_err(|e| {
                    OidcError::unresolvable_key(format!("cannot parse x5c certificate: {e}"))
                })
            })
            .collect::<OidcResult<_>>()?;

        let leaf_thumbprint = encode_segment(&Sha256::digest(&chain_der[0]));
        if !self.trusted_thumbprints.contains(&leaf_thumbprint) {
            return Err(OidcError::unresolvable_key(
                "x5c leaf certificate thumbprint is not trusted",
            ));
        }

        if certs.len() == 1 {
            certs[0].verify_signature(None).map_err(|e| {
                OidcError::unresolvable_key(format!("self-signed certificate check failed: {e}"))
            })?;
        } else {
            for i in 0..certs.len() - 1 {
                certs[i]
                    .verify_signature(Some(certs[i + 1].public_key()))
                    .map_err(|e| {
                        OidcError::unresolvable_key(format!(
                            "x5c chain validation failed at certificate {i}: {e}"
                        ))
                    })?;
            }
        }

        decoding_key_from_certificate(&certs[0])
    }
}

/// Extracts a verification key from a parsed leaf certificate.
fn decoding_key_from_certificate(cert: &X509Certificate<'_>) -> OidcResult<Arc<VerificationKey>> {
    let spki = cert.public_key();
    let (decoding_key, key_type) = match spki.parsed() {
        Ok(PublicKey::RSA(_)) => (
            DecodingKey::from_rsa_der(&spki.subject_public_key.data),
            KeyType::Rsa,
        ),
        Ok(PublicKey::EC(point)) => (DecodingKey::from_ec_der(point.data()), KeyType::Ec),
        _ => {
            return Err(OidcError::unresolvable_key(
                "x5c leaf certificate carries an unsupported public key type",
            ));
        }
    };

    Ok(Arc::new(VerificationKey {
        key_id: None,
        decoding_key,
        algorithm: None,
        key_type,
    }))
}

/// Configuration for the dynamic JWKS-backed resolver.
#[derive(Debug, Clone)]
pub struct DynamicResolverConfig {
    /// The provider's JWKS endpoint.
    pub jwks_uri: Url,

    /// Default TTL for the key-set snapshot and the per-key cache
    /// (default: 10 minutes).
    pub cache_ttl: Duration,

    /// Minimum snapshot TTL regardless of Cache-Control (default: 1 minute).
    pub min_ttl: Duration,

    /// Maximum snapshot TTL regardless of Cache-Control (default: 24 hours).
    pub max_ttl: Duration,

    /// Per-key cache capacity (default: 100).
    pub cache_max_size: usize,

    /// Cool-down between refreshes forced by "key not found"
    /// (default: 30 seconds).
    pub forced_refresh_interval: Duration,

    /// Whether to fall back to trying every published key when no
    /// identifier matches.
    pub try_all_keys: bool,

    /// Maximum JWKS response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) JWKS URIs. Testing only.
    pub allow_http: bool,
}

impl DynamicResolverConfig {
    /// Creates a configuration for the given JWKS endpoint with defaults.
    #[must_use]
    pub fn new(jwks_uri: Url) -> Self {
        Self {
            jwks_uri,
            cache_ttl: Duration::from_secs(600),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(86400),
            cache_max_size: 100,
            forced_refresh_interval: Duration::from_secs(30),
            try_all_keys: false,
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }

    /// Sets the snapshot and key cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the per-key cache capacity.
    #[must_use]
    pub fn with_cache_max_size(mut self, size: usize) -> Self {
        self.cache_max_size = size;
        self
    }

    /// Sets the forced-refresh cool-down.
    #[must_use]
    pub fn with_forced_refresh_interval(mut self, interval: Duration) -> Self {
        self.forced_refresh_interval = interval;
        self
    }

    /// Enables trying every published key when no identifier matches.
    #[must_use]
    pub fn with_try_all_keys(mut self, try_all: bool) -> Self {
        self.try_all_keys = try_all;
        self
    }

    /// Allows HTTP (non-HTTPS) JWKS URIs. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

struct CachedKeySet {
    set: Arc<KeySet>,
    expires_at: Instant,
}

/// Resolver fetching and caching the provider's JWKS.
pub struct DynamicKeyResolver {
    http_client: reqwest::Client,
    config: DynamicResolverConfig,
    key_set: tokio::sync::RwLock<Option<CachedKeySet>>,
    key_cache: ResultCache<String, Arc<VerificationKey>>,
    last_forced_refresh: Mutex<Option<Instant>>,
    cert_chain_fallback: Option<CertChainResolver>,
}

impl DynamicKeyResolver {
    /// Creates a resolver with an optional cert-chain fallback.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        config: DynamicResolverConfig,
        cert_chain_fallback: Option<CertChainResolver>,
    ) -> Self {
        let key_cache = ResultCache::new(config.cache_max_size, config.cache_ttl);
        Self {
            http_client,
            config,
            key_set: tokio::sync::RwLock::new(None),
            key_cache,
            last_forced_refresh: Mutex::new(None),
            cert_chain_fallback,
        }
    }

    /// Resolves a key for the given token headers.
    ///
    /// Resolution order: local per-key cache by kid/thumbprint; cert-chain
    /// delegation when the token carries only `x5c`; otherwise the (fresh
    /// or freshly fetched) key set is matched by kid, SHA-256 thumbprint
    /// and SHA-1 thumbprint — each strict when the corresponding header is
    /// present — then the keyless fallback, then try-all, then the
    /// cert-chain fallback.
    pub async fn resolve(&self, headers: &TokenHeaders) -> OidcResult<ResolvedKey> {
        if let Some(key) = self.cached_key(headers) {
            tracing::trace!("Key cache hit for {:?}", headers.key_id());
            return Ok(ResolvedKey::Single(key));
        }

        if !headers.has_key_identifier()
            && headers.certificate_chain().is_some()
            && let Some(fallback) = &self.cert_chain_fallback
        {
            return fallback.resolve(headers).map(ResolvedKey::Single);
        }

        let set = self.current_or_fetched_key_set().await?;
        self.match_in_key_set(&set, headers)
    }

    fn cached_key(&self, headers: &TokenHeaders) -> Option<Arc<VerificationKey>> {
        if let Some(kid) = headers.key_id() {
            return self.key_cache.get(&format!("kid:{kid}"));
        }
        if let Some(tp) = headers.s256_thumbprint() {
            return self.key_cache.get(&format!("s256:{tp}"));
        }
        if let Some(tp) = headers.thumbprint() {
            return self.key_cache.get(&format!("x5t:{tp}"));
        }
        None
    }

    fn match_in_key_set(
        &self,
        set: &KeySet,
        headers: &TokenHeaders,
    ) -> OidcResult<ResolvedKey> {
        // Each identifier is strict: a present kid that does not match any
        // published key fails resolution even if other fallbacks exist.
        if let Some(kid) = headers.key_id() {
            return match set.get_by_key_id(kid) {
                Some(key) => {
                    self.key_cache.insert(format!("kid:{kid}"), Arc::clone(&key));
                    Ok(ResolvedKey::Single(key))
                }
                None => Err(OidcError::unresolvable_key(format!(
                    "no key for kid {kid} in the JSON Web Key Set"
                ))),
            };
        }

        if let Some(tp) = headers.s256_thumbprint() {
            return match set.get_by_s256_thumbprint(tp) {
                Some(key) => {
                    self.key_cache.insert(format!("s256:{tp}"), Arc::clone(&key));
                    Ok(ResolvedKey::Single(key))
                }
                None => Err(OidcError::unresolvable_key(
                    "no key matching the x5t#S256 thumbprint",
                )),
            };
        }

        if let Some(tp) = headers.thumbprint() {
            return match set.get_by_thumbprint(tp) {
                Some(key) => {
                    self.key_cache.insert(format!("x5t:{tp}"), Arc::clone(&key));
                    Ok(ResolvedKey::Single(key))
                }
                None => Err(OidcError::unresolvable_key(
                    "no key matching the x5t thumbprint",
                )),
            };
        }

        if let Some(key) = set.get_keyless(headers.key_type()) {
            return Ok(ResolvedKey::Single(key));
        }

        if self.config.try_all_keys && !set.is_empty() {
            return Ok(ResolvedKey::TryAll(set.keys().to_vec()));
        }

        if let Some(fallback) = &self.cert_chain_fallback
            && headers.certificate_chain().is_some()
        {
            return fallback.resolve(headers).map(ResolvedKey::Single);
        }

        Err(OidcError::unresolvable_key(
            "token carries no key identifier matching the JSON Web Key Set",
        ))
    }

    /// Forces a key-set refresh, honoring the cool-down.
    ///
    /// Returns `true` if a refresh was performed, `false` if it was
    /// suppressed because another forced refresh ran within the configured
    /// interval.
    pub async fn force_refresh(&self) -> OidcResult<bool> {
        {
            let mut last = self
                .last_forced_refresh
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(at) = *last
                && at.elapsed() < self.config.forced_refresh_interval
            {
                tracing::debug!("Forced JWKS refresh suppressed by cool-down");
                return Ok(false);
            }
            *last = Some(Instant::now());
        }

        self.fetch_and_store().await?;
        self.key_cache.clear();
        Ok(true)
    }

    /// Fetches the key set eagerly, outside the forced-refresh accounting.
    /// Used at tenant-context creation when early resolution is enabled.
    pub async fn prefetch(&self) -> OidcResult<()> {
        self.fetch_and_store().await.map(|_| ())
    }

    async fn current_or_fetched_key_set(&self) -> OidcResult<Arc<KeySet>> {
        {
            let cached = self.key_set.read().await;
            if let Some(cached) = cached.as_ref()
                && Instant::now() < cached.expires_at
            {
                return Ok(Arc::clone(&cached.set));
            }
        }
        self.fetch_and_store().await
    }

    async fn fetch_and_store(&self) -> OidcResult<Arc<KeySet>> {
        self.validate_scheme()?;

        tracing::debug!("Fetching JWKS from {}", self.config.jwks_uri);
        let response = self
            .http_client
            .get(self.config.jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch JWKS from {}: {}", self.config.jwks_uri, e);
                OidcError::transport(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(OidcError::transport(format!(
                "JWKS endpoint returned status {}",
                response.status().as_u16()
            )));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(OidcError::transport(format!(
                "JWKS response exceeds maximum size of {} bytes",
                self.config.max_response_size
            )));
        }

        let ttl = self.ttl_from_cache_control(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| OidcError::transport(e.to_string()))?;
        let set = Arc::new(KeySet::from_jwks_json(&body)?);

        let mut cached = self.key_set.write().await;
        *cached = Some(CachedKeySet {
            set: Arc::clone(&set),
            expires_at: Instant::now() + ttl,
        });

        tracing::debug!("Cached key set with {} keys, TTL {:?}", set.len(), ttl);
        Ok(set)
    }

    fn validate_scheme(&self) -> OidcResult<()> {
        let scheme = self.config.jwks_uri.scheme();
        if scheme == "https" || (scheme == "http" && self.config.allow_http) {
            Ok(())
        } else {
            Err(OidcError::configuration(format!(
                "JWKS URI scheme {scheme} is not allowed"
            )))
        }
    }

    /// Extracts `max-age` from Cache-Control and clamps it between the
    /// configured minimum and maximum.
    fn ttl_from_cache_control(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        let ttl = headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',').find_map(|directive| {
                    directive.trim().strip_prefix("max-age=")?.parse::<u64>().ok()
                })
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.cache_ttl);

        ttl.min(self.config.max_ttl).max(self.config.min_ttl)
    }

    #[cfg(test)]
    async fn set_key_set_for_tests(&self, set: KeySet) {
        let mut cached = self.key_set.write().await;
        *cached = Some(CachedKeySet {
            set: Arc::new(set),
            expires_at: Instant::now() + Duration::from_secs(3600),
        });
    }
}

/// A verification-key resolver: static, certificate-chain, or dynamic.
pub enum KeyResolver {
    /// A single configured public key.
    Static(StaticKeyResolver),
    /// Truststore-validated `x5c` chains.
    CertChain(CertChainResolver),
    /// JWKS fetched from the provider.
    Dynamic(DynamicKeyResolver),
}

impl KeyResolver {
    /// Resolves a verification key for the given token headers.
    pub async fn resolve(&self, headers: &TokenHeaders) -> OidcResult<ResolvedKey> {
        match self {
            Self::Static(resolver) => Ok(ResolvedKey::Single(resolver.resolve())),
            Self::CertChain(resolver) => resolver.resolve(headers).map(ResolvedKey::Single),
            Self::Dynamic(resolver) => resolver.resolve(headers).await,
        }
    }

    /// Forces a key-set refresh where supported.
    ///
    /// Static and cert-chain resolvers have nothing to refresh and report
    /// `false`.
    pub async fn force_refresh(&self) -> OidcResult<bool> {
        match self {
            Self::Dynamic(resolver) => resolver.force_refresh().await,
            _ => Ok(false),
        }
    }
}
