//! Security identities and role extraction.
//!
//! An identity is built fresh per authenticated request and immutable once
//! built: principal, roles, scope-derived permissions, attributes (tenant
//! id, raw UserInfo/introspection documents, metadata snapshot, request
//! handle, expiry) and the token credentials that produced it.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::RolesConfig;
use crate::exchange::RequestHandle;
use crate::provider::OidcMetadata;

/// A permission derived from a `scope` value, split on `:` into a
/// resource and an optional action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    /// The resource part of the scope.
    pub resource: String,
    /// The action part, when the scope was `resource:action` formatted.
    pub action: Option<String>,
}

impl Permission {
    /// Parses one scope value.
    #[must_use]
    pub fn from_scope(scope: &str) -> Self {
        match scope.split_once(':') {
            Some((resource, action)) if !action.is_empty() => Self {
                resource: resource.to_string(),
                action: Some(action.to_string()),
            },
            _ => Self {
                resource: scope.to_string(),
                action: None,
            },
        }
    }

    /// Returns `true` if this permission implies `resource`/`action`.
    #[must_use]
    pub fn implies(&self, resource: &str, action: Option<&str>) -> bool {
        self.resource == resource
            && match (&self.action, action) {
                (_, None) => true,
                (Some(own), Some(wanted)) => own == wanted,
                (None, Some(_)) => false,
            }
    }
}

/// The token credentials attached to an identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityCredentials {
    /// The verified primary access token.
    pub access_token: Option<String>,
    /// The verified ID token, for code-flow identities.
    pub id_token: Option<String>,
    /// The refresh token stored in the session.
    pub refresh_token: Option<String>,
}

/// Request-scoped identity attributes.
#[derive(Debug, Clone)]
pub struct IdentityAttributes {
    /// The tenant that authenticated the request.
    pub tenant_id: String,
    /// Raw UserInfo claims, when fetched.
    pub user_info: Option<Value>,
    /// Raw introspection response, when introspection ran.
    pub introspection: Option<Value>,
    /// Snapshot of the provider metadata in effect.
    pub metadata: Arc<OidcMetadata>,
    /// Handle of the request the identity was built for.
    pub request: RequestHandle,
    /// Unix timestamp the identity expires at, from the token's `exp`.
    pub expires_at: Option<i64>,
}

/// The product of a successful authentication.
#[derive(Debug, Clone)]
pub struct SecurityIdentity {
    /// Principal name: `preferred_username`, `upn` or `sub`.
    pub principal: String,
    /// Roles extracted from the configured claim source.
    pub roles: HashSet<String>,
    /// Permissions derived from the granted scopes.
    pub permissions: Vec<Permission>,
    /// Request-scoped attributes.
    pub attributes: IdentityAttributes,
    /// The tokens backing this identity.
    pub credentials: IdentityCredentials,
    /// The verified claims of the primary token.
    pub claims: Value,
}

impl SecurityIdentity {
    /// Returns `true` if the identity carries the role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Returns `true` if any permission implies `resource`/`action`.
    #[must_use]
    pub fn has_permission(&self, resource: &str, action: Option<&str>) -> bool {
        self.permissions
            .iter()
            .any(|p| p.implies(resource, action))
    }
}

/// Picks the principal name from a claim document.
#[must_use]
pub fn principal_name(claims: &Value) -> String {
    for claim in ["preferred_username", "upn", "sub", "username"] {
        if let Some(name) = claims.get(claim).and_then(|v| v.as_str()) {
            return name.to_string();
        }
    }
    String::new()
}

/// Extracts roles from a claim document.
///
/// A configured claim path wins; without one the `groups` claim is used,
/// falling back to the Keycloak `realm_access.roles` and
/// `resource_access.<clientId>.roles` locations only when no `groups`
/// claim exists.
#[must_use]
pub fn extract_roles(
    source: &Value,
    config: &RolesConfig,
    client_id: Option<&str>,
) -> HashSet<String> {
    let mut roles = HashSet::new();

    if !config.role_claim_path.is_empty() {
        for path in &config.role_claim_path {
            if let Some(value) = lookup_claim_path(source, path) {
                collect_roles(value, config.role_claim_separator.as_deref(), &mut roles);
            }
        }
        return roles;
    }

    if let Some(groups) = source.get("groups") {
        collect_roles(groups, config.role_claim_separator.as_deref(), &mut roles);
        return roles;
    }

    if let Some(realm_roles) = lookup_claim_path(source, "realm_access/roles") {
        collect_roles(realm_roles, None, &mut roles);
    }
    if let Some(client_id) = client_id
        && let Some(client_roles) =
            lookup_claim_path(source, &format!("resource_access/{client_id}/roles"))
    {
        collect_roles(client_roles, None, &mut roles);
    }

    roles
}

/// Derives permissions from a space-separated scope string.
#[must_use]
pub fn permissions_from_scope(scope: Option<&str>) -> Vec<Permission> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(Permission::from_scope)
        .collect()
}

/// Resolves a `/`-separated claim path against nested JSON objects.
#[must_use]
pub fn lookup_claim_path<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = source;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = current.get(segment)?;
    }
    Some(current)
}

fn collect_roles(value: &Value, separator: Option<&str>, roles: &mut HashSet<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                if let Some(role) = item.as_str() {
                    roles.insert(role.to_string());
                }
            }
        }
        Value::String(s) => {
            let separator = separator.unwrap_or(",");
            for role in s.split(separator) {
                let role = role.trim();
                if !role.is_empty() {
                    roles.insert(role.to_string());
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles_of(source: Value, config: RolesConfig) -> HashSet<String> {
        extract_roles(&source, &config, Some("client-1"))
    }

    #[test]
    fn test_groups_claim_default() {
        let roles = roles_of(
            serde_json::json!({"groups": ["admin", "user"]}),
            RolesConfig::default(),
        );
        assert_eq!(roles.len(), 2);
        assert!(roles.contains("admin"));
        assert!(roles.contains("user"));
    }

    #[test]
    fn test_groups_beats_keycloak_fallback() {
        let roles = roles_of(
            serde_json::json!({
                "groups": ["from-groups"],
                "realm_access": {"roles": ["from-realm"]},
            }),
            RolesConfig::default(),
        );
        assert!(roles.contains("from-groups"));
        assert!(!roles.contains("from-realm"));
    }

    #[test]
    fn test_keycloak_fallback_without_groups() {
        let roles = roles_of(
            serde_json::json!({
                "realm_access": {"roles": ["realm-role"]},
                "resource_access": {
                    "client-1": {"roles": ["client-role"]},
                    "other-client": {"roles": ["ignored"]},
                },
            }),
            RolesConfig::default(),
        );
        assert!(roles.contains("realm-role"));
        assert!(roles.contains("client-role"));
        assert!(!roles.contains("ignored"));
    }

    #[test]
    fn test_explicit_claim_path() {
        let config = RolesConfig {
            role_claim_path: vec!["app/permissions/list".to_string()],
            ..RolesConfig::default()
        };
        let roles = roles_of(
            serde_json::json!({
                "app": {"permissions": {"list": ["a", "b"]}},
                "groups": ["not-used"],
            }),
            config,
        );
        assert_eq!(roles.len(), 2);
        assert!(roles.contains("a"));
        assert!(!roles.contains("not-used"));
    }

    #[test]
    fn test_string_claim_split_by_separator() {
        let config = RolesConfig {
            role_claim_path: vec!["roles".to_string()],
            role_claim_separator: Some(" ".to_string()),
            ..RolesConfig::default()
        };
        let roles = roles_of(serde_json::json!({"roles": "one two three"}), config);
        assert_eq!(roles.len(), 3);

        let config = RolesConfig {
            role_claim_path: vec!["roles".to_string()],
            ..RolesConfig::default()
        };
        let roles = roles_of(serde_json::json!({"roles": "a,b"}), config);
        assert!(roles.contains("a") && roles.contains("b"));
    }

    #[test]
    fn test_permissions_from_scope() {
        let permissions = permissions_from_scope(Some("openid orders:read orders:write profile"));
        assert_eq!(permissions.len(), 4);

        let read = Permission::from_scope("orders:read");
        assert_eq!(read.resource, "orders");
        assert_eq!(read.action.as_deref(), Some("read"));
        assert!(read.implies("orders", Some("read")));
        assert!(read.implies("orders", None));
        assert!(!read.implies("orders", Some("write")));

        let plain = Permission::from_scope("openid");
        assert!(plain.action.is_none());
        assert!(!plain.implies("openid", Some("read")));
    }

    #[test]
    fn test_principal_name_precedence() {
        assert_eq!(
            principal_name(&serde_json::json!({
                "sub": "s-1",
                "preferred_username": "alice",
            })),
            "alice"
        );
        assert_eq!(principal_name(&serde_json::json!({"sub": "s-1"})), "s-1");
        assert_eq!(principal_name(&serde_json::json!({})), "");
    }

    #[test]
    fn test_lookup_claim_path() {
        let doc = serde_json::json!({"a": {"b": {"c": 42}}});
        assert_eq!(lookup_claim_path(&doc, "a/b/c"), Some(&serde_json::json!(42)));
        assert!(lookup_claim_path(&doc, "a/x").is_none());
        assert_eq!(lookup_claim_path(&doc, "a/b"), Some(&serde_json::json!({"c": 42})));
    }
}
