//! Relying-party error types.
//!
//! This module defines all error types that can occur while resolving a
//! tenant, talking to the provider, or validating tokens. Expected
//! control-flow signals (redirects, token auto-refresh) are *not* errors —
//! they are modeled as [`crate::engine::AuthenticationOutcome`] variants.

use std::fmt;

/// Classification of a token validation failure.
///
/// The kind drives the fallback chain: an [`TokenValidationKind::Expired`]
/// failure on a code-flow session triggers a refresh attempt, while a
/// signature or claim failure is terminal for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidationKind {
    /// Token structure could not be parsed (wrong segment count, bad
    /// base64, bad JSON).
    Malformed,
    /// Signature verification failed.
    Signature,
    /// The token is expired, or its age exceeds the configured maximum.
    Expired,
    /// The `iss` claim does not match the expected issuer.
    Issuer,
    /// The `aud` claim does not contain an expected audience.
    Audience,
    /// The `sub` claim is required but absent.
    Subject,
    /// The `nonce` claim does not match the expected value.
    Nonce,
    /// A required claim is absent.
    MissingClaim,
    /// A required claim is present with an unexpected value.
    ClaimMismatch,
    /// A custom validator demanded a stronger authentication context.
    /// Carries the ACR values the caller should request from the provider.
    InsufficientAuthentication {
        /// The required ACR values, preserved for the challenge redirect.
        acr_values: Vec<String>,
    },
}

/// Errors produced by the relying-party core.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// The tenant configuration is invalid. Fatal at tenant-context
    /// construction for static tenants.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// No verification key could be resolved for a token. Triggers the
    /// refresh/introspection fallback chain before becoming terminal.
    #[error("Unresolvable key: {message}")]
    UnresolvableKey {
        /// Description of why no key matched.
        message: String,
    },

    /// Structural, signature, or claim validation failure.
    #[error("Token validation failed ({kind:?}): {message}")]
    TokenValidation {
        /// The failure classification.
        kind: TokenValidationKind,
        /// Description of the failure.
        message: String,
    },

    /// Terminal, request-scoped authentication failure. Wraps any of the
    /// other variants plus introspection/UserInfo failures.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the failure.
        message: String,
    },

    /// Connection-level failure against the provider. Retried per the
    /// configured policy before surfacing.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The provider could not be reached after exhausting retries. The
    /// tenant stays (or returns to) NOT_READY; the process keeps running.
    #[error("OIDC server is not available: {message}")]
    ServerUnavailable {
        /// Description of the connection problem.
        message: String,
    },

    /// The session cookie payload could not be decrypted or decoded.
    /// A *missing* cookie is "no session", never this error.
    #[error("Session state error: {message}")]
    Session {
        /// Description of the problem.
        message: String,
    },
}

impl OidcError {
    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `UnresolvableKey` error.
    #[must_use]
    pub fn unresolvable_key(message: impl Into<String>) -> Self {
        Self::UnresolvableKey {
            message: message.into(),
        }
    }

    /// Creates a new `TokenValidation` error.
    #[must_use]
    pub fn validation(kind: TokenValidationKind, message: impl Into<String>) -> Self {
        Self::TokenValidation {
            kind,
            message: message.into(),
        }
    }

    /// Creates an `Expired`-classified validation error.
    #[must_use]
    pub fn expired(message: impl Into<String>) -> Self {
        Self::validation(TokenValidationKind::Expired, message)
    }

    /// Creates a `Malformed`-classified validation error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::validation(TokenValidationKind::Malformed, message)
    }

    /// Creates a new `AuthenticationFailed` error.
    #[must_use]
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new `ServerUnavailable` error.
    #[must_use]
    pub fn server_unavailable(message: impl Into<String>) -> Self {
        Self::ServerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Session` error.
    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Returns `true` if this failure means no verification key was found.
    #[must_use]
    pub fn is_unresolvable_key(&self) -> bool {
        matches!(self, Self::UnresolvableKey { .. })
    }

    /// Returns `true` if this is an expiry-classified validation failure.
    ///
    /// The code-flow mechanism uses this to decide whether a stored
    /// refresh token should be redeemed instead of failing the request.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(
            self,
            Self::TokenValidation {
                kind: TokenValidationKind::Expired,
                ..
            }
        )
    }

    /// Returns `true` if this is a transport-level failure eligible for
    /// the connection retry policy.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns `true` if this error is fatal at tenant-context creation.
    #[must_use]
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Returns the ACR values attached to an insufficient-authentication
    /// failure, if any.
    #[must_use]
    pub fn required_acr_values(&self) -> Option<&[String]> {
        match self {
            Self::TokenValidation {
                kind: TokenValidationKind::InsufficientAuthentication { acr_values },
                ..
            } => Some(acr_values),
            _ => None,
        }
    }

    /// Returns the OAuth 2.0 error code used to enrich bearer challenges.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::TokenValidation {
                kind: TokenValidationKind::InsufficientAuthentication { .. },
                ..
            } => "insufficient_user_authentication",
            Self::TokenValidation { .. } | Self::UnresolvableKey { .. } => "invalid_token",
            Self::AuthenticationFailed { .. } | Self::Session { .. } => "invalid_token",
            Self::Configuration { .. }
            | Self::Transport { .. }
            | Self::ServerUnavailable { .. } => "server_error",
        }
    }
}

impl fmt::Display for TokenValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::Signature => write!(f, "signature"),
            Self::Expired => write!(f, "expired"),
            Self::Issuer => write!(f, "issuer"),
            Self::Audience => write!(f, "audience"),
            Self::Subject => write!(f, "subject"),
            Self::Nonce => write!(f, "nonce"),
            Self::MissingClaim => write!(f, "missing claim"),
            Self::ClaimMismatch => write!(f, "claim mismatch"),
            Self::InsufficientAuthentication { .. } => write!(f, "insufficient authentication"),
        }
    }
}

/// Type alias for relying-party results.
pub type OidcResult<T> = Result<T, OidcError>;
