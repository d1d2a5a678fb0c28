//! The bearer-token mechanism.
//!
//! Service APIs authenticate with a token carried in the `Authorization`
//! header (or a configured alternate header, with or without a scheme
//! prefix). A missing token produces no credentials so another mechanism
//! can run; a failed verification produces a 401 challenge.

use crate::config::TenantConfig;
use crate::error::OidcError;
use crate::exchange::{ChallengeResponse, RequestContext, extract_bearer};

/// Default bearer scheme.
pub const BEARER_SCHEME: &str = "Bearer";

/// Extracts the bearer token according to the tenant's header settings.
#[must_use]
pub fn extract_token(request: &RequestContext, config: &TenantConfig) -> Option<String> {
    match config.token.header_name.as_deref() {
        None => extract_bearer(request, "Authorization", Some(BEARER_SCHEME)),
        Some(header) => extract_bearer(
            request,
            header,
            config.token.authorization_scheme.as_deref(),
        ),
    }
}

/// Builds the 401 challenge, enriched with `error`, `error_description`
/// and `acr_values` parameters when the failure warrants them.
#[must_use]
pub fn challenge(config: &TenantConfig, error: Option<&OidcError>) -> ChallengeResponse {
    let scheme = config
        .token
        .authorization_scheme
        .as_deref()
        .unwrap_or(BEARER_SCHEME);

    let Some(error) = error else {
        return ChallengeResponse::unauthorized(scheme);
    };

    let mut value = format!("{scheme} error=\"{}\"", error.oauth_error_code());
    if let Some(acr_values) = error.required_acr_values() {
        value.push_str(&format!(
            ", error_description=\"A different authentication level is required\", acr_values=\"{}\"",
            acr_values.join(" ")
        ));
    }
    ChallengeResponse {
        status: http::StatusCode::UNAUTHORIZED,
        headers: vec![("WWW-Authenticate".to_string(), value)],
        cookies: Vec::new(),
    }
}
