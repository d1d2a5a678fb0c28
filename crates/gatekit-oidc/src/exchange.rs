//! The HTTP exchange boundary.
//!
//! The HTTP server itself is out of scope: the host application adapts its
//! framework's request into a [`RequestContext`] snapshot and applies the
//! cookies/redirects/challenges the engine hands back. Nothing here owns a
//! live connection — identities keep a numeric [`RequestHandle`] instead of
//! a pointer back into the server's request object.
//!
//! The module also carries the two capabilities the application
//! substitutes: a bounded [`BlockingExecutor`] for CPU-bound crypto and
//! disk I/O, and a [`SecurityEventSink`] for session lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::{HeaderMap, Method, StatusCode};

use crate::error::{OidcError, OidcResult};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying the request an identity was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// A read-only snapshot of one incoming HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    path: String,
    authority: Option<String>,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    cookies: HashMap<String, String>,
    secure: bool,
    tenant_override: Option<String>,
    handle: RequestHandle,
}

impl RequestContext {
    /// Starts building a request snapshot for the given method and path.
    #[must_use]
    pub fn builder(method: Method, path: impl Into<String>) -> RequestContextBuilder {
        RequestContextBuilder {
            method,
            path: path.into(),
            authority: None,
            headers: HeaderMap::new(),
            query: Vec::new(),
            cookies: HashMap::new(),
            secure: false,
            tenant_override: None,
        }
    }

    /// The host (and optional port) the request was addressed to.
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Builds an absolute URL on this request's scheme and authority.
    #[must_use]
    pub fn absolute_url(&self, path_and_query: &str) -> Option<url::Url> {
        let authority = self.authority.as_deref()?;
        let scheme = if self.secure { "https" } else { "http" };
        url::Url::parse(&format!("{scheme}://{authority}{path_and_query}")).ok()
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The first value of a request header, when it is valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The first value of a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All query parameters in request order.
    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// A cookie value by name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// All cookies on the request.
    #[must_use]
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Whether the request arrived over TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// A tenant id forced onto this request by an annotation or
    /// programmatic override; consulted before any other resolution step.
    #[must_use]
    pub fn tenant_override(&self) -> Option<&str> {
        self.tenant_override.as_deref()
    }

    /// The request handle identities refer back to.
    #[must_use]
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Returns `true` when the caller looks like an XHR/SPA client that
    /// cannot follow a 302 to a third-party origin.
    #[must_use]
    pub fn is_xhr(&self) -> bool {
        self.header("X-Requested-With")
            .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
            || self
                .header("Sec-Fetch-Mode")
                .is_some_and(|v| v.eq_ignore_ascii_case("cors"))
    }
}

/// Builder for [`RequestContext`].
pub struct RequestContextBuilder {
    method: Method,
    path: String,
    authority: Option<String>,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    cookies: HashMap<String, String>,
    secure: bool,
    tenant_override: Option<String>,
}

impl RequestContextBuilder {
    /// Sets the host (and optional port) the request was addressed to.
    #[must_use]
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.parse::<http::header::HeaderName>(),
            value.parse::<http::header::HeaderValue>(),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Adds a cookie.
    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Marks the request as received over TLS.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Forces a tenant id onto the request.
    #[must_use]
    pub fn tenant_override(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_override = Some(tenant_id.into());
        self
    }

    /// Finishes the snapshot, assigning it a fresh handle.
    #[must_use]
    pub fn build(self) -> RequestContext {
        RequestContext {
            method: self.method,
            path: self.path,
            authority: self.authority,
            headers: self.headers,
            query: self.query,
            cookies: self.cookies,
            secure: self.secure,
            tenant_override: self.tenant_override,
            handle: RequestHandle(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }
}

/// Extracts a bearer token from a request.
///
/// With the default `Authorization` header the value must start with the
/// scheme (case-insensitive). A custom header configured without a scheme
/// carries the raw token as its value.
#[must_use]
pub fn extract_bearer(
    request: &RequestContext,
    header_name: &str,
    scheme: Option<&str>,
) -> Option<String> {
    let value = request.header(header_name)?;
    match scheme {
        Some(scheme) => {
            let (prefix, token) = value.split_once(' ')?;
            if prefix.eq_ignore_ascii_case(scheme) && !token.trim().is_empty() {
                Some(token.trim().to_string())
            } else {
                None
            }
        }
        None => {
            let token = value.trim();
            if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            }
        }
    }
}

/// A challenge the host application writes back to the client.
#[derive(Debug, Clone)]
pub struct ChallengeResponse {
    /// Response status: 401 for bearer, 302 for code-flow redirects, 499
    /// for SPA clients in manual-redirect mode.
    pub status: StatusCode,
    /// Headers to set, including `WWW-Authenticate` and `Location`.
    pub headers: Vec<(String, String)>,
    /// Cookies to set alongside the challenge.
    pub cookies: Vec<cookie::Cookie<'static>>,
}

impl ChallengeResponse {
    /// A bare 401 with the given `WWW-Authenticate` scheme.
    #[must_use]
    pub fn unauthorized(scheme: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            headers: vec![("WWW-Authenticate".to_string(), scheme.to_string())],
            cookies: Vec::new(),
        }
    }

    /// A 302 redirect.
    #[must_use]
    pub fn redirect(location: &url::Url) -> Self {
        Self {
            status: StatusCode::FOUND,
            headers: vec![("Location".to_string(), location.to_string())],
            cookies: Vec::new(),
        }
    }
}

/// Bounded executor for CPU-bound or disk-bound work.
///
/// Authentication pipelines never run private-key operations or truststore
/// loading inline on the I/O thread; they go through this executor.
#[derive(Clone)]
pub struct BlockingExecutor {
    permits: Arc<tokio::sync::Semaphore>,
}

impl BlockingExecutor {
    /// Creates an executor allowing at most `max_concurrent` blocking jobs.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runs a blocking closure off the async thread and awaits its result.
    pub async fn run<F, T>(&self, job: F) -> OidcResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| OidcError::authentication_failed("blocking executor is shut down"))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| OidcError::authentication_failed(format!("blocking job failed: {e}")))
    }
}

impl Default for BlockingExecutor {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Security lifecycle events the application can observe.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// A code-flow session was established.
    SessionEstablished {
        /// The tenant the session belongs to.
        tenant_id: String,
    },
    /// A session's tokens were refreshed.
    SessionRefreshed {
        /// The tenant the session belongs to.
        tenant_id: String,
    },
    /// A session ended through RP-initiated logout.
    SessionEnded {
        /// The tenant the session belonged to.
        tenant_id: String,
    },
    /// A back-channel logout token was accepted.
    BackchannelLogout {
        /// The tenant the logout token was issued for.
        tenant_id: String,
        /// The `sub` or `sid` the token targets.
        subject: String,
    },
}

/// Sink for [`SecurityEvent`]s. The application substitutes its own
/// implementation; the default discards events.
pub trait SecurityEventSink: Send + Sync {
    /// Delivers one event.
    fn dispatch(&self, event: SecurityEvent);
}

/// Event sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl SecurityEventSink for NoopEventSink {
    fn dispatch(&self, _event: SecurityEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_context_accessors() {
        let request = RequestContext::builder(Method::GET, "/api/orders")
            .header("Authorization", "Bearer abc")
            .query_param("state", "xyz")
            .cookie("q_session", "payload")
            .secure(true)
            .build();

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.path(), "/api/orders");
        assert_eq!(request.header("Authorization"), Some("Bearer abc"));
        assert_eq!(request.header("authorization"), Some("Bearer abc"));
        assert_eq!(request.query_param("state"), Some("xyz"));
        assert_eq!(request.cookie("q_session"), Some("payload"));
        assert!(request.is_secure());
        assert!(request.tenant_override().is_none());
    }

    #[test]
    fn test_request_handles_are_unique() {
        let a = RequestContext::builder(Method::GET, "/").build();
        let b = RequestContext::builder(Method::GET, "/").build();
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_xhr_detection() {
        let xhr = RequestContext::builder(Method::GET, "/")
            .header("X-Requested-With", "XMLHttpRequest")
            .build();
        assert!(xhr.is_xhr());

        let plain = RequestContext::builder(Method::GET, "/").build();
        assert!(!plain.is_xhr());
    }

    #[test]
    fn test_challenge_constructors() {
        let challenge = ChallengeResponse::unauthorized("Bearer");
        assert_eq!(challenge.status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            challenge.headers[0],
            ("WWW-Authenticate".to_string(), "Bearer".to_string())
        );

        let url = url::Url::parse("https://op.example.com/authorize?x=1").unwrap();
        let redirect = ChallengeResponse::redirect(&url);
        assert_eq!(redirect.status, StatusCode::FOUND);
        assert_eq!(redirect.headers[0].0, "Location");
    }

    #[tokio::test]
    async fn test_blocking_executor_runs_job() {
        let executor = BlockingExecutor::new(2);
        let result = executor.run(|| 21 * 2).await.unwrap();
        assert_eq!(result, 42);
    }
}
