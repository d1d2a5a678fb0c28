//! Cookie naming and attribute policy.
//!
//! Cookie names carry the tenant id as a suffix for every non-default
//! tenant, plus an optional configured suffix, so multiple tenants can
//! coexist under one host without clobbering each other's state.

use std::time::Duration;

use cookie::{Cookie, SameSite};

use crate::config::{DEFAULT_TENANT_ID, TenantConfig};

/// Base name of the session (token state) cookie.
pub const SESSION_COOKIE_NAME: &str = "q_session";

/// Base name of the transient state cookie used during the code flow.
pub const STATE_COOKIE_NAME: &str = "q_auth";

/// Base name of the post-logout anti-CSRF cookie.
pub const POST_LOGOUT_COOKIE_NAME: &str = "q_post_logout";

/// Suffix of the split access-token cookie.
pub const ACCESS_TOKEN_COOKIE_SUFFIX: &str = "_at";

/// Suffix of the split refresh-token cookie.
pub const REFRESH_TOKEN_COOKIE_SUFFIX: &str = "_rt";

/// Infix used by chunked cookie names (`q_session_chunk_1`, ...).
pub const CHUNK_INFIX: &str = "_chunk_";

/// Lifetime of the transient state cookie.
pub const STATE_COOKIE_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// The per-tenant suffix appended to every cookie name.
#[must_use]
pub fn cookie_name_suffix(config: &TenantConfig) -> String {
    let mut suffix = String::new();
    if config.tenant_id != DEFAULT_TENANT_ID {
        suffix.push('_');
        suffix.push_str(&config.tenant_id);
    }
    if let Some(custom) = &config.authentication.cookie_suffix {
        suffix.push('_');
        suffix.push_str(custom);
    }
    suffix
}

/// The session cookie name for a tenant.
#[must_use]
pub fn session_cookie_name(config: &TenantConfig) -> String {
    format!("{SESSION_COOKIE_NAME}{}", cookie_name_suffix(config))
}

/// The state cookie name for a tenant.
#[must_use]
pub fn state_cookie_name(config: &TenantConfig) -> String {
    format!("{STATE_COOKIE_NAME}{}", cookie_name_suffix(config))
}

/// The post-logout cookie name for a tenant.
#[must_use]
pub fn post_logout_cookie_name(config: &TenantConfig) -> String {
    format!("{POST_LOGOUT_COOKIE_NAME}{}", cookie_name_suffix(config))
}

/// Builds a cookie with the tenant's attribute policy.
#[must_use]
pub fn build_cookie(
    name: String,
    value: String,
    config: &TenantConfig,
    request_is_secure: bool,
    max_age: Duration,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_http_only(true);
    cookie.set_secure(request_is_secure || config.authentication.cookie_force_secure);
    cookie.set_path(config.authentication.cookie_path.clone());
    cookie.set_same_site(SameSite::Lax);
    if let Some(domain) = &config.authentication.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookie.set_max_age(
        cookie::time::Duration::try_from(max_age)
            .unwrap_or(cookie::time::Duration::seconds(i64::MAX / 2)),
    );
    cookie
}

/// Builds an expired cookie that removes `name` on the client.
#[must_use]
pub fn removal_cookie(name: String, config: &TenantConfig) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, String::new());
    cookie.set_http_only(true);
    cookie.set_path(config.authentication.cookie_path.clone());
    if let Some(domain) = &config.authentication.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookie.set_max_age(cookie::time::Duration::ZERO);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tenant_has_no_suffix() {
        let config = TenantConfig::default();
        assert_eq!(session_cookie_name(&config), "q_session");
        assert_eq!(state_cookie_name(&config), "q_auth");
        assert_eq!(post_logout_cookie_name(&config), "q_post_logout");
    }

    #[test]
    fn test_tenant_and_custom_suffix() {
        let mut config = TenantConfig::new("hr");
        assert_eq!(session_cookie_name(&config), "q_session_hr");

        config.authentication.cookie_suffix = Some("v2".to_string());
        assert_eq!(session_cookie_name(&config), "q_session_hr_v2");
        assert_eq!(state_cookie_name(&config), "q_auth_hr_v2");
    }

    #[test]
    fn test_cookie_attributes() {
        let mut config = TenantConfig::default();
        config.authentication.cookie_path = "/app".to_string();
        config.authentication.cookie_domain = Some("example.com".to_string());

        let cookie = build_cookie(
            "q_session".to_string(),
            "v".to_string(),
            &config,
            false,
            Duration::from_secs(600),
        );
        assert!(cookie.http_only().unwrap_or(false));
        assert_eq!(cookie.secure(), Some(false));
        assert_eq!(cookie.path(), Some("/app"));
        assert_eq!(cookie.domain(), Some("example.com"));
        assert_eq!(
            cookie.max_age(),
            Some(cookie::time::Duration::seconds(600))
        );
    }

    #[test]
    fn test_secure_forced_or_tls() {
        let mut config = TenantConfig::default();
        let cookie = build_cookie(
            "n".to_string(),
            "v".to_string(),
            &config,
            true,
            Duration::from_secs(1),
        );
        assert_eq!(cookie.secure(), Some(true));

        config.authentication.cookie_force_secure = true;
        let cookie = build_cookie(
            "n".to_string(),
            "v".to_string(),
            &config,
            false,
            Duration::from_secs(1),
        );
        assert_eq!(cookie.secure(), Some(true));
    }

    #[test]
    fn test_removal_cookie_expires_immediately() {
        let config = TenantConfig::default();
        let cookie = removal_cookie("q_session".to_string(), &config);
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::ZERO));
        assert_eq!(cookie.value(), "");
    }
}
