//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use gatekit_oidc::exchange::BlockingExecutor;
use gatekit_oidc::tenant::ContextFactory;
use gatekit_oidc::{
    ApplicationType, AuthenticationEngine, EngineConfig, TenantConfig, TenantRegistry,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use url::Url;

/// A freshly generated RSA signing key with its JWK representation.
pub struct TestKey {
    pub kid: String,
    pub encoding_key: EncodingKey,
    pub jwk: serde_json::Value,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate RSA key");
        let public_key = private_key.to_public_key();

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private key");
        let encoding_key =
            EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("load private key");

        use rsa::traits::PublicKeyParts;
        let jwk = serde_json::json!({
            "kty": "RSA",
            "kid": kid,
            "use": "sig",
            "alg": "RS256",
            "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        });

        Self {
            kid: kid.to_string(),
            encoding_key,
            jwk,
        }
    }

    pub fn sign(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).expect("sign token")
    }

    pub fn jwks_document(&self) -> serde_json::Value {
        serde_json::json!({"keys": [self.jwk]})
    }
}

/// A tenant pointed at a local mock provider, with discovery disabled and
/// every endpoint configured explicitly.
pub fn mock_tenant(server_uri: &str) -> TenantConfig {
    let mut config = TenantConfig::default();
    config.auth_server_url = Some(Url::parse(server_uri).expect("server uri"));
    config.client_id = Some("test-client".to_string());
    config.credentials.secret = Some("test-secret".to_string());
    config.discovery_enabled = false;
    config.endpoints.authorization_path = Some("/authorize".to_string());
    config.endpoints.token_path = Some("/token".to_string());
    config.endpoints.jwks_path = Some("/jwks".to_string());
    config.endpoints.introspection_path = Some("/introspect".to_string());
    config.endpoints.end_session_path = Some("/end-session".to_string());
    config.connection.allow_http = true;
    config.connection.metadata_init_timeout = std::time::Duration::from_secs(5);
    config.jwks.resolve_early = false;
    config
}

pub fn web_app_tenant(server_uri: &str) -> TenantConfig {
    let mut config = mock_tenant(server_uri);
    config.application_type = ApplicationType::WebApp;
    config.authentication.id_token_required = false;
    config
}

pub fn engine_for(default_config: TenantConfig) -> AuthenticationEngine {
    let registry = Arc::new(
        TenantRegistry::new(
            default_config,
            Vec::new(),
            ContextFactory::new(BlockingExecutor::new(4)),
        )
        .expect("registry"),
    );
    AuthenticationEngine::new(
        registry,
        None,
        None,
        BlockingExecutor::new(4),
        EngineConfig::default(),
    )
}

pub fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// The issuer value matching a tenant built by [`mock_tenant`].
pub fn issuer_of(server_uri: &str) -> String {
    server_uri.trim_end_matches('/').to_string()
}
