//! The back-channel logout endpoint.
//!
//! Providers POST a signed logout token (`application/x-www-form-urlencoded`,
//! parameter `logout_token`) to tell this relying party a session ended,
//! independent of the browser. A validated token is answered with 200 and
//! recorded against the `sub`/`sid` it names; the next code-flow request
//! for that session consumes the record and fails authentication. Every
//! validation problem is a 400.

use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use serde_json::Value;

use crate::engine::AuthenticationEngine;
use crate::exchange::{RequestContext, SecurityEvent};
use crate::tenant::context::TenantConfigContext;

/// The event type a logout token must carry in its `events` claim.
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Form parameter carrying the logout token.
pub const LOGOUT_TOKEN_PARAM: &str = "logout_token";

/// Handles one back-channel logout POST.
///
/// `form` is the parsed request body; body parsing itself belongs to the
/// HTTP layer.
pub async fn handle(
    engine: &AuthenticationEngine,
    request: &RequestContext,
    form: &HashMap<String, String>,
) -> StatusCode {
    if request.method() != http::Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED;
    }

    let form_encoded = request
        .header("Content-Type")
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !form_encoded {
        tracing::debug!("Back-channel logout with wrong content type");
        return StatusCode::BAD_REQUEST;
    }

    let Some(logout_token) = form.get(LOGOUT_TOKEN_PARAM).filter(|t| !t.is_empty()) else {
        tracing::debug!("Back-channel logout without a logout_token");
        return StatusCode::BAD_REQUEST;
    };

    let Some(context) = resolve_backchannel_tenant(engine, request).await else {
        tracing::debug!(
            "No tenant exposes a back-channel logout endpoint at {}",
            request.path()
        );
        return StatusCode::BAD_REQUEST;
    };

    let provider = match context
        .ensure_initialized(engine.registry().factory())
        .await
    {
        Ok(provider) => provider,
        Err(err) => {
            tracing::warn!(
                "Back-channel logout for tenant {} failed to initialize the provider: {}",
                context.tenant_id(),
                err
            );
            return StatusCode::BAD_REQUEST;
        }
    };

    let claims = match provider.verify_logout_token(logout_token).await {
        Ok(verified) => verified.claims,
        Err(err) => {
            tracing::debug!(
                "Back-channel logout token rejected for tenant {}: {}",
                context.tenant_id(),
                err
            );
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(reason) = check_logout_claims(&claims) {
        tracing::debug!(
            "Back-channel logout token claims rejected for tenant {}: {}",
            context.tenant_id(),
            reason
        );
        return StatusCode::BAD_REQUEST;
    }

    let subject = claims
        .get("sid")
        .or_else(|| claims.get("sub"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    engine.record_backchannel_logout(context.tenant_id(), &claims);
    engine.events().dispatch(SecurityEvent::BackchannelLogout {
        tenant_id: context.tenant_id().to_string(),
        subject,
    });
    tracing::debug!(
        "Accepted back-channel logout token for tenant {}",
        context.tenant_id()
    );
    StatusCode::OK
}

/// Finds the tenant whose configured back-channel path matches the
/// request, falling back to the default tenant's configured path.
async fn resolve_backchannel_tenant(
    engine: &AuthenticationEngine,
    request: &RequestContext,
) -> Option<Arc<TenantConfigContext>> {
    let registry = engine.registry();

    let tenant_id = registry
        .static_configs()
        .iter()
        .find(|(_, config)| {
            config
                .logout
                .backchannel
                .path
                .as_deref()
                .is_some_and(|path| path == request.path())
        })
        .map(|(id, _)| id.clone())?;

    registry.get_or_create_static(&tenant_id).await.ok().flatten()
}

/// Structural claim rules from the back-channel logout specification: an
/// `events` object keyed by the logout event type, `sub` or `sid`, and no
/// `nonce`.
fn check_logout_claims(claims: &Value) -> Result<(), &'static str> {
    let has_event = claims
        .get("events")
        .and_then(|events| events.as_object())
        .is_some_and(|events| {
            events
                .get(BACKCHANNEL_LOGOUT_EVENT)
                .is_some_and(Value::is_object)
        });
    if !has_event {
        return Err("missing back-channel logout event");
    }

    let has_subject = claims.get("sub").and_then(|v| v.as_str()).is_some()
        || claims.get("sid").and_then(|v| v.as_str()).is_some();
    if !has_subject {
        return Err("neither sub nor sid is present");
    }

    if claims.get("nonce").is_some() {
        return Err("logout tokens must not carry a nonce");
    }

    Ok(())
}
