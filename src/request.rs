//! Request model and normalization.
//!
//! A [`Request`] is a plain value describing one outbound HTTP call. Before
//! execution it is normalized into a [`PreparedRequest`], the shape handed
//! to the [`HttpTransport`](crate::transport::HttpTransport).

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::watch;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// HTTP methods supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Request protocols supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

/// Errors raised when a request value is structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestBuildError {
    #[error("path must begin with '/' (got {0:?})")]
    InvalidPath(String),
}

/// Cancellation token shared between a caller and in-flight work.
///
/// Cancelling aborts the current transport call and prevents any further
/// retry attempt. Cloned tokens observe the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender gone without a cancel signal: park forever so select! arms
        // racing against this future are unaffected.
        std::future::pending::<()>().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One outbound HTTP call, before normalization.
#[derive(Debug, Clone)]
pub struct Request {
    pub hostname: String,
    pub protocol: Protocol,
    pub port: Option<u16>,
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    /// Query parameters, kept sorted so cache fingerprints are stable.
    pub query: BTreeMap<String, String>,
    pub timeout: Duration,
    pub cancel: Option<CancelToken>,
}

impl Request {
    /// Start building a request against `hostname`.
    pub fn builder(hostname: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(hostname)
    }

    /// Normalize into the adapter shape.
    ///
    /// An empty hostname is tolerated: it is reported as a validation
    /// warning and an empty authority is injected, leaving the transport to
    /// fail the call.
    pub fn prepare(&self) -> Result<PreparedRequest, RequestBuildError> {
        if !self.path.starts_with('/') {
            return Err(RequestBuildError::InvalidPath(self.path.clone()));
        }
        if self.hostname.is_empty() {
            tracing::warn!(path = %self.path, "request has empty hostname");
        }
        let port = self.port.unwrap_or_else(|| self.protocol.default_port());
        Ok(PreparedRequest {
            base_url: format!("{}://{}:{}", self.protocol.as_str(), self.hostname, port),
            url: self.path.clone(),
            method: self.method,
            headers: self.headers.clone(),
            data: self.body.clone(),
            params: self.query.clone(),
            timeout: self.timeout,
        })
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    fn new(hostname: impl Into<String>) -> Self {
        Self {
            request: Request {
                hostname: hostname.into(),
                protocol: Protocol::Https,
                port: None,
                method: Method::Get,
                path: "/".to_string(),
                headers: HashMap::new(),
                body: None,
                query: BTreeMap::new(),
                timeout: DEFAULT_REQUEST_TIMEOUT,
                cancel: None,
            },
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.request.protocol = protocol;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.request.port = Some(port);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.request.method = method;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.request.path = path.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.request.body = Some(body);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = timeout;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.request.cancel = Some(token);
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

/// Adapter-shaped request handed to the transport.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PreparedRequest {
    pub base_url: String,
    pub url: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub data: Option<Value>,
    pub params: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prepare_builds_base_url_with_default_port() {
        let req = Request::builder("api.example.com").path("/v1/items").build();
        let prepared = req.prepare().unwrap();
        assert_eq!(prepared.base_url, "https://api.example.com:443");
        assert_eq!(prepared.url, "/v1/items");
        assert_eq!(prepared.method, Method::Get);
        assert_eq!(prepared.timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn prepare_uses_explicit_port_and_protocol() {
        let req = Request::builder("localhost")
            .protocol(Protocol::Http)
            .port(8080)
            .method(Method::Post)
            .path("/submit")
            .body(json!({"a": 1}))
            .build();
        let prepared = req.prepare().unwrap();
        assert_eq!(prepared.base_url, "http://localhost:8080");
        assert_eq!(prepared.data, Some(json!({"a": 1})));
    }

    #[test]
    fn prepare_rejects_relative_path() {
        let req = Request::builder("api.example.com").path("v1/items").build();
        let err = req.prepare().unwrap_err();
        assert!(matches!(err, RequestBuildError::InvalidPath(p) if p == "v1/items"));
    }

    #[test]
    fn prepare_tolerates_empty_hostname() {
        let req = Request::builder("").path("/x").build();
        let prepared = req.prepare().unwrap();
        assert_eq!(prepared.base_url, "https://:443");
    }

    #[test]
    fn query_parameters_are_sorted() {
        let req = Request::builder("h").query("z", "1").query("a", "2").build();
        let prepared = req.prepare().unwrap();
        let keys: Vec<_> = prepared.params.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "z"]);
    }

    #[tokio::test]
    async fn cancel_token_signals_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
