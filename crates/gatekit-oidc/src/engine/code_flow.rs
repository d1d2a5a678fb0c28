//! The authorization-code-flow mechanism.
//!
//! State machine: no session → challenge redirect with a fresh opaque
//! state; callback with `code` → state-cookie CSRF check, code exchange,
//! session cookie; session cookie present → verify the stored ID token,
//! refreshing on (or shortly before) expiry; logout path → RP-initiated
//! logout redirect.
//!
//! The state cookie value is `<state-id>|<encrypted payload>` where the
//! payload carries the PKCE verifier, the nonce and the optional restore
//! path. The CSRF check requires the `state` query parameter to be a
//! prefix of the stored cookie value; any mismatch is terminal.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::engine::identity::SecurityIdentity;
use crate::engine::{AuthenticationEngine, AuthenticationOutcome, IdentityVerification};
use crate::error::{OidcError, OidcResult};
use crate::exchange::{ChallengeResponse, RequestContext, SecurityEvent};
use crate::provider::{AuthorizationCodeTokens, Provider};
use crate::session::{
    self, STATE_COOKIE_MAX_AGE, SessionCodec, build_cookie, removal_cookie, session_cookie_name,
    state_cookie_name,
};
use crate::tenant::context::TenantConfigContext;
use crate::token::codec::{self, encode_segment};

/// Query parameters stripped by the redirect-parameter cleanup.
const REDIRECT_PARAMS: [&str; 4] = ["code", "state", "session_state", "iss"];

/// Encrypted content of the state cookie.
#[derive(Debug, Serialize, Deserialize)]
struct StatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    restore_path: Option<String>,
}

pub(crate) async fn authenticate(
    engine: &AuthenticationEngine,
    context: &Arc<TenantConfigContext>,
    provider: &Arc<Provider>,
    request: &RequestContext,
) -> OidcResult<AuthenticationOutcome> {
    let config = context.config();
    let codec = SessionCodec::new(context.secrets().token_encryption_key);
    let cookie_name = session_cookie_name(config);

    let session = codec
        .decode(
            request.cookies(),
            &config.authentication.token_state,
            &cookie_name,
        )
        .map_err(|err| {
            OidcError::authentication_failed(format!("session cookie is unusable: {err}"))
        })?;

    if let Some(tokens) = session {
        return reauthenticate(engine, context, provider, request, tokens).await;
    }

    if request.query_param("code").is_some() {
        return redeem_code(engine, context, provider, request).await;
    }

    Ok(AuthenticationOutcome::NoCredentials)
}

/// A request with a valid session cookie: verify the stored ID token,
/// refresh when expired (or expiring soon), then serve logout if the
/// request targets the logout path.
async fn reauthenticate(
    engine: &AuthenticationEngine,
    context: &Arc<TenantConfigContext>,
    provider: &Arc<Provider>,
    request: &RequestContext,
    tokens: AuthorizationCodeTokens,
) -> OidcResult<AuthenticationOutcome> {
    let config = context.config();
    let id_token = tokens.id_token.clone().ok_or_else(|| {
        OidcError::authentication_failed("session cookie carries no ID token")
    })?;

    let verification = engine
        .build_identity(context, provider, request, &id_token, true, Some(&tokens), None)
        .await;

    let (identity, refreshed_cookies) = match verification {
        Ok(IdentityVerification::Ready(identity)) => (identity, Vec::new()),
        Ok(IdentityVerification::NeedsRefresh(identity)) => {
            // Still valid, but inside the proactive-refresh window. A
            // failed refresh here keeps the current identity.
            match refresh_session(engine, context, provider, request, &tokens).await {
                Ok((refreshed, cookies)) => (refreshed, cookies),
                Err(err) => {
                    tracing::debug!(
                        "Proactive token refresh failed, keeping current identity: {}",
                        err
                    );
                    (identity, Vec::new())
                }
            }
        }
        Err(err) if err.is_expired() && config.token.refresh_expired => {
            refresh_session(engine, context, provider, request, &tokens).await?
        }
        Err(err) => return Err(err),
    };

    if engine.consume_backchannel_logout(context.tenant_id(), &identity.claims) {
        return Err(OidcError::authentication_failed(
            "session was terminated by back-channel logout",
        ));
    }

    if let Some(logout_path) = config.logout.path.as_deref()
        && request.path() == logout_path
    {
        return logout(engine, context, provider, request, &identity, &tokens).await;
    }

    Ok(AuthenticationOutcome::Granted {
        identity,
        cookies: refreshed_cookies,
    })
}

/// Redeems the stored refresh token and rebuilds the identity, replacing
/// the session cookie.
async fn refresh_session(
    engine: &AuthenticationEngine,
    context: &Arc<TenantConfigContext>,
    provider: &Arc<Provider>,
    request: &RequestContext,
    tokens: &AuthorizationCodeTokens,
) -> OidcResult<(SecurityIdentity, Vec<cookie::Cookie<'static>>)> {
    let refresh_token = tokens.refresh_token.as_deref().ok_or_else(|| {
        OidcError::authentication_failed("session has expired and carries no refresh token")
    })?;

    let mut refreshed = provider.refresh_tokens(refresh_token).await?;
    // Providers may rotate only some of the tokens.
    if refreshed.id_token.is_none() {
        refreshed.id_token = tokens.id_token.clone();
    }
    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = tokens.refresh_token.clone();
    }

    let id_token = refreshed.id_token.clone().ok_or_else(|| {
        OidcError::authentication_failed("token refresh returned no ID token")
    })?;

    let verification = engine
        .build_identity(
            context,
            provider,
            request,
            &id_token,
            true,
            Some(&refreshed),
            None,
        )
        .await?;
    let identity = match verification {
        IdentityVerification::Ready(identity)
        | IdentityVerification::NeedsRefresh(identity) => identity,
    };

    let cookies = session_cookies(context, request, &refreshed)?;
    engine.events().dispatch(SecurityEvent::SessionRefreshed {
        tenant_id: context.tenant_id().to_string(),
    });
    tracing::debug!("Refreshed session tokens for tenant {}", context.tenant_id());
    Ok((identity, cookies))
}

/// A callback request carrying `code`: CSRF-check the state cookie,
/// exchange the code, establish the session.
async fn redeem_code(
    engine: &AuthenticationEngine,
    context: &Arc<TenantConfigContext>,
    provider: &Arc<Provider>,
    request: &RequestContext,
) -> OidcResult<AuthenticationOutcome> {
    let config = context.config();
    let state_cookie = state_cookie_name(config);

    let Some(cookie_value) = request.cookie(&state_cookie) else {
        return Err(OidcError::authentication_failed(
            "code flow callback without a state cookie",
        ));
    };
    let Some(state_param) = request.query_param("state") else {
        return Err(OidcError::authentication_failed(
            "code flow callback without a state parameter",
        ));
    };
    if state_param.is_empty() || !cookie_value.starts_with(state_param) {
        // CSRF defense: the state must match what this client was given.
        return Err(OidcError::authentication_failed(
            "state parameter does not match the state cookie",
        ));
    }

    let payload = parse_state_cookie(context, cookie_value)?;
    let code = request
        .query_param("code")
        .unwrap_or_default()
        .to_string();

    let redirect_uri = callback_uri(config, request)?;
    let mut tokens = provider
        .get_code_flow_tokens(&code, redirect_uri.as_str(), payload.code_verifier.as_deref())
        .await?;

    if tokens.id_token.is_none() {
        if config.authentication.id_token_required {
            return Err(OidcError::authentication_failed(
                "token response carries no ID token",
            ));
        }
        // The provider is a plain OAuth2 server: mint an internal ID
        // token over the access-token claims.
        tokens.id_token = Some(mint_internal_id_token(context, &tokens)?);
    }

    let id_token = tokens.id_token.clone().unwrap_or_default();
    let verification = engine
        .build_identity(
            context,
            provider,
            request,
            &id_token,
            true,
            Some(&tokens),
            payload.nonce.clone(),
        )
        .await?;
    let identity = match verification {
        IdentityVerification::Ready(identity)
        | IdentityVerification::NeedsRefresh(identity) => identity,
    };

    let mut cookies = session_cookies(context, request, &tokens)?;
    cookies.push(removal_cookie(state_cookie, config));
    engine.events().dispatch(SecurityEvent::SessionEstablished {
        tenant_id: context.tenant_id().to_string(),
    });

    // Restore the original request, or at least strip code/state from the
    // address bar; both behaviors are independently configurable.
    let restore_target = restore_redirect(config, request, payload.restore_path.as_deref());
    match restore_target {
        Some(location) => Ok(AuthenticationOutcome::Redirect { location, cookies }),
        None => Ok(AuthenticationOutcome::Granted { identity, cookies }),
    }
}

/// RP-initiated logout: revoke what we can, drop the session cookie and
/// redirect to the provider's end-session endpoint.
async fn logout(
    engine: &AuthenticationEngine,
    context: &Arc<TenantConfigContext>,
    provider: &Arc<Provider>,
    request: &RequestContext,
    identity: &SecurityIdentity,
    tokens: &AuthorizationCodeTokens,
) -> OidcResult<AuthenticationOutcome> {
    let config = context.config();

    if let Some(access_token) = &tokens.access_token {
        let _ = provider.revoke(access_token, Some("access_token")).await;
    }
    if let Some(refresh_token) = &tokens.refresh_token {
        let _ = provider.revoke(refresh_token, Some("refresh_token")).await;
    }

    let end_session = provider
        .metadata()
        .end_session_endpoint
        .as_deref()
        .ok_or_else(|| {
            OidcError::configuration("logout requires an end-session endpoint")
        })?;
    let mut location = Url::parse(end_session)
        .map_err(|e| OidcError::configuration(format!("invalid end-session endpoint: {e}")))?;

    let mut cookies = vec![removal_cookie(session_cookie_name(config), config)];
    {
        let mut params = location.query_pairs_mut();
        if let Some(id_token) = &identity.credentials.id_token {
            params.append_pair("id_token_hint", id_token);
        }
        if let Some(post_logout_path) = config.logout.post_logout_path.as_deref() {
            let post_logout_uri = request.absolute_url(post_logout_path).ok_or_else(|| {
                OidcError::configuration(
                    "post-logout redirect requires the request authority",
                )
            })?;
            params.append_pair("post_logout_redirect_uri", post_logout_uri.as_str());

            let state = random_token();
            params.append_pair("state", &state);
            cookies.push(build_cookie(
                session::post_logout_cookie_name(config),
                state,
                config,
                request.is_secure(),
                STATE_COOKIE_MAX_AGE,
            ));
        }
    }

    engine.events().dispatch(SecurityEvent::SessionEnded {
        tenant_id: context.tenant_id().to_string(),
    });
    tracing::debug!("RP-initiated logout for tenant {}", context.tenant_id());
    Ok(AuthenticationOutcome::Redirect { location, cookies })
}

/// Builds the challenge: a redirect to the authorization endpoint with a
/// fresh state cookie, or a 499 signal for SPA clients configured for
/// manual redirects.
pub(crate) fn challenge(
    context: &Arc<TenantConfigContext>,
    provider: &Arc<Provider>,
    request: &RequestContext,
) -> OidcResult<ChallengeResponse> {
    let config = context.config();
    let authorization_endpoint = provider
        .metadata()
        .authorization_endpoint
        .as_deref()
        .ok_or_else(|| {
            OidcError::configuration("no authorization endpoint is available")
        })?;
    let mut location = Url::parse(authorization_endpoint).map_err(|e| {
        OidcError::configuration(format!("invalid authorization endpoint: {e}"))
    })?;

    let state_id = random_token();
    let nonce = config
        .authentication
        .nonce_required
        .then(random_token);
    let code_verifier = config
        .authentication
        .pkce_required
        .then(random_token);

    let restore_path = config
        .authentication
        .restore_path_after_redirect
        .then(|| original_request_uri(request))
        .filter(|uri| !uri.is_empty());

    let redirect_uri = callback_uri(config, request)?;

    {
        let mut params = location.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair(
            "client_id",
            config.client_id.as_deref().unwrap_or_default(),
        );
        params.append_pair("redirect_uri", redirect_uri.as_str());
        params.append_pair("scope", &requested_scopes(config));
        params.append_pair("state", &state_id);
        if let Some(nonce) = &nonce {
            params.append_pair("nonce", nonce);
        }
        if let Some(verifier) = &code_verifier {
            params.append_pair("code_challenge", &pkce_s256_challenge(verifier));
            params.append_pair("code_challenge_method", "S256");
        }
    }

    let payload = StatePayload {
        code_verifier,
        nonce,
        restore_path,
    };
    let cookie_value = build_state_cookie_value(context, &state_id, &payload)?;
    let state_cookie = build_cookie(
        state_cookie_name(config),
        cookie_value,
        config,
        request.is_secure(),
        STATE_COOKIE_MAX_AGE,
    );

    if request.is_xhr() && !config.authentication.java_script_auto_redirect {
        // SPA clients cannot follow a cross-origin 302; hand them the
        // target and let the application script decide.
        return Ok(ChallengeResponse {
            status: http::StatusCode::from_u16(499).unwrap_or(http::StatusCode::UNAUTHORIZED),
            headers: vec![
                ("WWW-Authenticate".to_string(), "OIDC".to_string()),
                ("Location".to_string(), location.to_string()),
            ],
            cookies: vec![state_cookie],
        });
    }

    let mut response = ChallengeResponse::redirect(&location);
    response.cookies.push(state_cookie);
    Ok(response)
}

fn requested_scopes(config: &crate::config::TenantConfig) -> String {
    let mut scopes = vec!["openid".to_string()];
    for scope in &config.authentication.scopes {
        if !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.clone());
        }
    }
    scopes.join(" ")
}

/// The registered redirect URI: the configured redirect path, or the path
/// that triggered the challenge.
fn callback_uri(
    config: &crate::config::TenantConfig,
    request: &RequestContext,
) -> OidcResult<Url> {
    let path = config
        .authentication
        .redirect_path
        .as_deref()
        .unwrap_or_else(|| request.path());
    request.absolute_url(path).ok_or_else(|| {
        OidcError::configuration("code flow requires the request authority to build redirect URIs")
    })
}

/// The original path + query, preserved across the provider redirect.
fn original_request_uri(request: &RequestContext) -> String {
    let query: Vec<String> = request
        .query_params()
        .iter()
        .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
        .collect();
    if query.is_empty() {
        request.path().to_string()
    } else {
        format!("{}?{}", request.path(), query.join("&"))
    }
}

/// The post-redeem redirect: the restored original URI when configured,
/// else the current URI stripped of redirect parameters.
fn restore_redirect(
    config: &crate::config::TenantConfig,
    request: &RequestContext,
    restore_path: Option<&str>,
) -> Option<Url> {
    if config.authentication.restore_path_after_redirect
        && let Some(restore) = restore_path
    {
        let differs = restore != original_request_uri(request);
        if differs {
            return request.absolute_url(restore);
        }
    }

    if config.authentication.remove_redirect_parameters {
        let remaining: Vec<String> = request
            .query_params()
            .iter()
            .filter(|(k, _)| !REDIRECT_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        let target = if remaining.is_empty() {
            request.path().to_string()
        } else {
            format!("{}?{}", request.path(), remaining.join("&"))
        };
        return request.absolute_url(&target);
    }

    None
}

fn build_state_cookie_value(
    context: &TenantConfigContext,
    state_id: &str,
    payload: &StatePayload,
) -> OidcResult<String> {
    let json = serde_json::to_string(payload)
        .map_err(|e| OidcError::session(format!("cannot serialize state payload: {e}")))?;
    let sealed = SessionCodec::new(context.secrets().pkce_secret).encrypt(&json)?;
    Ok(format!("{state_id}|{sealed}"))
}

fn parse_state_cookie(
    context: &TenantConfigContext,
    cookie_value: &str,
) -> OidcResult<StatePayload> {
    let Some((_, sealed)) = cookie_value.split_once('|') else {
        return Ok(StatePayload {
            code_verifier: None,
            nonce: None,
            restore_path: None,
        });
    };
    let json = SessionCodec::new(context.secrets().pkce_secret).decrypt(sealed)?;
    serde_json::from_str(&json)
        .map_err(|e| OidcError::session(format!("state payload is invalid: {e}")))
}

/// Mints the internal HS256 ID token standing in for a provider that
/// returned none.
fn mint_internal_id_token(
    context: &TenantConfigContext,
    tokens: &AuthorizationCodeTokens,
) -> OidcResult<String> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let lifetime = tokens
        .access_token_expires_in
        .unwrap_or_else(|| context.config().authentication.session_age_extension.as_secs() as i64);

    let access_claims = tokens
        .access_token
        .as_deref()
        .and_then(codec::decode_claims);
    let subject = access_claims
        .as_ref()
        .and_then(|claims| claims.get("sub").and_then(|v| v.as_str()))
        .unwrap_or("authenticated");

    let claims = serde_json::json!({
        "sub": subject,
        "iat": now,
        "exp": now + lifetime.max(1),
        "aud": context.config().client_id,
    });
    crate::token::verifier::issue_self_signed(
        &claims,
        &context.secrets().internal_id_token_secret,
    )
}

/// Renders the session cookie set for freshly obtained tokens.
fn session_cookies(
    context: &TenantConfigContext,
    request: &RequestContext,
    tokens: &AuthorizationCodeTokens,
) -> OidcResult<Vec<cookie::Cookie<'static>>> {
    let config = context.config();
    let codec = SessionCodec::new(context.secrets().token_encryption_key);
    let encoded = codec.encode(
        tokens,
        &config.authentication.token_state,
        &session_cookie_name(config),
    )?;

    // Cookie lifetime follows the token lifespan plus the configured
    // extension, so the refresh path can still find the refresh token.
    let lifespan = tokens
        .access_token_expires_in
        .or_else(|| {
            tokens
                .id_token
                .as_deref()
                .and_then(codec_expiry_in)
        })
        .unwrap_or(300)
        .max(1) as u64;
    let max_age = std::time::Duration::from_secs(lifespan)
        + config.authentication.session_age_extension;

    Ok(encoded
        .into_iter()
        .map(|(name, value)| {
            build_cookie(name, value, config, request.is_secure(), max_age)
        })
        .collect())
}

fn codec_expiry_in(token: &str) -> Option<i64> {
    let claims = codec::decode_claims(token)?;
    let exp = claims.get("exp")?.as_i64()?;
    Some(exp - time::OffsetDateTime::now_utc().unix_timestamp())
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    encode_segment(&bytes)
}

fn pkce_s256_challenge(verifier: &str) -> String {
    encode_segment(&Sha256::digest(verifier.as_bytes()))
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
