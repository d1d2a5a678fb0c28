//! End-to-end mechanism tests against a mock provider.

mod common;

use std::collections::HashMap;

use common::{TestKey, engine_for, issuer_of, mock_tenant, now, web_app_tenant};
use gatekit_oidc::tenant::DerivedSecrets;
use gatekit_oidc::{
    AuthenticationOutcome, RequestContext, SessionCodec, TokenStateConfig,
};
use http::Method;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bearer_request(token: &str) -> RequestContext {
    RequestContext::builder(Method::GET, "/api/orders")
        .authority("app.example.com")
        .header("Authorization", &format!("Bearer {token}"))
        .build()
}

#[tokio::test]
async fn bearer_happy_path_hits_the_key_cache() {
    let server = MockServer::start().await;
    let key = TestKey::generate("k1");

    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(key.jwks_document()))
        .expect(1) // one fetch; the second request uses the cached key
        .mount(&server)
        .await;

    let engine = engine_for(mock_tenant(&server.uri()));
    let token = key.sign(&serde_json::json!({
        "iss": issuer_of(&server.uri()),
        "aud": "test-client",
        "sub": "alice",
        "exp": now() + 3600,
        "iat": now(),
        "groups": ["admin", "user"],
        "scope": "openid orders:read",
    }));

    for _ in 0..2 {
        let outcome = engine.authenticate(&bearer_request(&token)).await.unwrap();
        let AuthenticationOutcome::Granted { identity, cookies } = outcome else {
            panic!("expected a granted identity");
        };
        assert!(cookies.is_empty());
        assert_eq!(identity.principal, "alice");
        assert!(identity.has_role("admin"));
        assert!(identity.has_role("user"));
        assert!(identity.has_permission("orders", Some("read")));
        assert_eq!(identity.attributes.tenant_id, "Default");
        assert!(identity.attributes.expires_at.unwrap() > now());
    }
}

#[tokio::test]
async fn bearer_rejects_token_signed_by_unknown_key() {
    let server = MockServer::start().await;
    let published = TestKey::generate("k1");
    let rogue = TestKey::generate("k1"); // same kid, different key material

    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(published.jwks_document()))
        .mount(&server)
        .await;

    let engine = engine_for(mock_tenant(&server.uri()));
    let token = rogue.sign(&serde_json::json!({
        "iss": issuer_of(&server.uri()),
        "aud": "test-client",
        "exp": now() + 3600,
    }));

    assert!(engine.authenticate(&bearer_request(&token)).await.is_err());
}

#[tokio::test]
async fn opaque_token_introspects_exactly_once() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "active": true,
            "sub": "alice",
            "username": "alice@example.com",
            "scope": "openid profile",
            "exp": now() + 600,
        })))
        .expect(1) // the second request is served from the cache
        .mount(&server)
        .await;

    let engine = engine_for(mock_tenant(&server.uri()));

    for _ in 0..2 {
        let outcome = engine
            .authenticate(&bearer_request("an-opaque-access-token"))
            .await
            .unwrap();
        let AuthenticationOutcome::Granted { identity, .. } = outcome else {
            panic!("expected a granted identity");
        };
        assert_eq!(identity.principal, "alice@example.com");
        assert!(identity.attributes.introspection.is_some());
        assert!(identity.has_permission("profile", None));
    }
}

#[tokio::test]
async fn inactive_introspection_fails_authentication() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/introspect"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"active": false})),
        )
        .mount(&server)
        .await;

    let engine = engine_for(mock_tenant(&server.uri()));
    let err = engine
        .authenticate(&bearer_request("revoked-opaque-token"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("inactive"));
}

#[tokio::test]
async fn code_flow_challenge_then_callback_establishes_a_session() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "opaque-at",
            "refresh_token": "rt-1",
            "expires_in": 600,
            "scope": "openid",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(web_app_tenant(&server.uri()));

    // Anonymous request: no identity, so the caller asks for a challenge.
    let anonymous = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .build();
    let outcome = engine.authenticate(&anonymous).await.unwrap();
    assert!(matches!(outcome, AuthenticationOutcome::NoCredentials));

    let challenge = engine.challenge(&anonymous, None).await.unwrap();
    assert_eq!(challenge.status, http::StatusCode::FOUND);
    let location = challenge
        .headers
        .iter()
        .find(|(name, _)| name == "Location")
        .map(|(_, value)| url::Url::parse(value).unwrap())
        .unwrap();
    assert!(location.as_str().starts_with(&format!("{}/authorize", server.uri())));

    let query: HashMap<String, String> = location
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert_eq!(query["response_type"], "code");
    assert_eq!(query["client_id"], "test-client");
    assert!(query["scope"].contains("openid"));
    let state = query["state"].clone();

    let state_cookie = challenge
        .cookies
        .iter()
        .find(|c| c.name() == "q_auth")
        .expect("state cookie");
    assert!(state_cookie.value().starts_with(&state));

    // The provider redirects back with the code.
    let callback = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .query_param("code", "auth-code-1")
        .query_param("state", &state)
        .cookie("q_auth", state_cookie.value())
        .build();
    let outcome = engine.authenticate(&callback).await.unwrap();

    // code/state are stripped with a redirect; the session cookie rides
    // along.
    let AuthenticationOutcome::Redirect { location, cookies } = outcome else {
        panic!("expected the post-redeem redirect");
    };
    assert_eq!(location.as_str(), "http://app.example.com/app");
    let session_cookie = cookies
        .iter()
        .find(|c| c.name() == "q_session" && !c.value().is_empty())
        .expect("session cookie");

    // The next request authenticates from the session cookie alone.
    let with_session = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .cookie("q_session", session_cookie.value())
        .build();
    let outcome = engine.authenticate(&with_session).await.unwrap();
    let AuthenticationOutcome::Granted { identity, .. } = outcome else {
        panic!("expected a granted identity");
    };
    assert_eq!(identity.attributes.tenant_id, "Default");
    assert!(identity.credentials.id_token.is_some());
    assert_eq!(identity.credentials.access_token.as_deref(), Some("opaque-at"));
}

#[tokio::test]
async fn code_flow_rejects_state_mismatch_without_token_exchange() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(0) // CSRF failures never reach the token endpoint
        .mount(&server)
        .await;

    let engine = engine_for(web_app_tenant(&server.uri()));

    let callback = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .query_param("code", "auth-code-1")
        .query_param("state", "attacker-state")
        .cookie("q_auth", "legitimate-state|sealed-payload")
        .build();
    assert!(engine.authenticate(&callback).await.is_err());

    // A callback without any state cookie is just as terminal.
    let no_cookie = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .query_param("code", "auth-code-1")
        .query_param("state", "whatever")
        .build();
    assert!(engine.authenticate(&no_cookie).await.is_err());
}

/// Builds a session cookie the way an earlier login would have, signing
/// the internal ID token with the tenant's derived secret.
fn forged_session_cookie(
    config: &gatekit_oidc::TenantConfig,
    id_claims: &serde_json::Value,
    refresh_token: &str,
) -> String {
    let secrets = DerivedSecrets::derive(config);
    let id_token = gatekit_oidc::token::verifier::issue_self_signed(
        id_claims,
        &secrets.internal_id_token_secret,
    )
    .unwrap();

    let tokens = gatekit_oidc::AuthorizationCodeTokens {
        id_token: Some(id_token),
        access_token: Some("opaque-at".to_string()),
        refresh_token: Some(refresh_token.to_string()),
        access_token_expires_in: None,
        access_token_scope: None,
    };
    let codec = SessionCodec::new(secrets.token_encryption_key);
    let mut encoded = codec
        .encode(&tokens, &TokenStateConfig::default(), "q_session")
        .unwrap();
    encoded.remove(0).1
}

#[tokio::test]
async fn session_expiring_soon_is_refreshed_proactively() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "refreshed-at",
            "refresh_token": "rt-new",
            "expires_in": 600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = web_app_tenant(&server.uri());
    config.token.refresh_expired = true;
    config.token.refresh_token_time_skew = Some(std::time::Duration::from_secs(30));

    // The stored ID token is still valid but expires in 10 seconds,
    // inside the 30-second proactive window.
    let cookie_value = forged_session_cookie(
        &config,
        &serde_json::json!({
            "iss": issuer_of(&server.uri()),
            "aud": "test-client",
            "sub": "alice",
            "iat": now(),
            "exp": now() + 10,
        }),
        "rt-old",
    );

    let engine = engine_for(config);
    let request = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .cookie("q_session", &cookie_value)
        .build();

    let outcome = engine.authenticate(&request).await.unwrap();
    let AuthenticationOutcome::Granted { identity, cookies } = outcome else {
        panic!("expected a granted identity after the refresh");
    };
    assert_eq!(identity.principal, "alice");
    assert_eq!(
        identity.credentials.access_token.as_deref(),
        Some("refreshed-at")
    );
    // The session cookie was replaced with the refreshed tokens.
    let session_cookie = cookies
        .iter()
        .find(|c| c.name() == "q_session")
        .expect("replaced session cookie");
    assert_ne!(session_cookie.value(), cookie_value);
}

#[tokio::test]
async fn expired_session_fails_when_refresh_is_disabled() {
    let server = MockServer::start().await;
    let config = web_app_tenant(&server.uri());

    let cookie_value = forged_session_cookie(
        &config,
        &serde_json::json!({
            "iss": issuer_of(&server.uri()),
            "aud": "test-client",
            "sub": "alice",
            "iat": now() - 3600,
            "exp": now() - 600,
        }),
        "rt-old",
    );

    let engine = engine_for(config);
    let request = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .cookie("q_session", &cookie_value)
        .build();

    let err = engine.authenticate(&request).await.unwrap_err();
    assert!(err.is_expired());
}

#[tokio::test]
async fn backchannel_logout_terminates_the_session() {
    let server = MockServer::start().await;
    let key = TestKey::generate("k1");

    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(key.jwks_document()))
        .mount(&server)
        .await;

    let mut config = web_app_tenant(&server.uri());
    config.logout.backchannel.path = Some("/back-channel/logout".to_string());

    let cookie_value = forged_session_cookie(
        &config,
        &serde_json::json!({
            "iss": issuer_of(&server.uri()),
            "aud": "test-client",
            "sub": "alice",
            "iat": now(),
            "exp": now() + 3600,
        }),
        "rt-1",
    );

    // The default tenant is also the statically configured one here, so
    // the back-channel path lookup finds it.
    let engine = engine_for(config);

    let logout_token = key.sign(&serde_json::json!({
        "iss": issuer_of(&server.uri()),
        "aud": "test-client",
        "sub": "alice",
        "iat": now(),
        "events": {
            "http://schemas.openid.net/event/backchannel-logout": {}
        },
    }));

    let post = RequestContext::builder(Method::POST, "/back-channel/logout")
        .authority("app.example.com")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .build();
    let form: HashMap<String, String> =
        [("logout_token".to_string(), logout_token)].into_iter().collect();

    let status = gatekit_oidc::engine::backchannel::handle(&engine, &post, &form).await;
    assert_eq!(status, http::StatusCode::OK);

    // A replayed POST still answers 200 per protocol.
    let status = gatekit_oidc::engine::backchannel::handle(&engine, &post, &form).await;
    assert_eq!(status, http::StatusCode::OK);

    // The next session request consumes the pending logout and fails.
    let request = RequestContext::builder(Method::GET, "/app")
        .authority("app.example.com")
        .cookie("q_session", &cookie_value)
        .build();
    assert!(engine.authenticate(&request).await.is_err());

    // Consumed: the same session check passes afterwards (nothing left to
    // replay against it).
    let outcome = engine.authenticate(&request).await.unwrap();
    assert!(matches!(outcome, AuthenticationOutcome::Granted { .. }));
}

#[tokio::test]
async fn backchannel_rejects_bad_tokens() {
    let server = MockServer::start().await;
    let mut config = web_app_tenant(&server.uri());
    config.logout.backchannel.path = Some("/back-channel/logout".to_string());
    let engine = engine_for(config);

    let post = RequestContext::builder(Method::POST, "/back-channel/logout")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .build();

    // Missing token.
    let status =
        gatekit_oidc::engine::backchannel::handle(&engine, &post, &HashMap::new()).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);

    // Wrong content type.
    let wrong_type = RequestContext::builder(Method::POST, "/back-channel/logout")
        .header("Content-Type", "application/json")
        .build();
    let form: HashMap<String, String> =
        [("logout_token".to_string(), "x.y.z".to_string())].into_iter().collect();
    let status = gatekit_oidc::engine::backchannel::handle(&engine, &wrong_type, &form).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);

    // Garbage token.
    let status = gatekit_oidc::engine::backchannel::handle(&engine, &post, &form).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
}
