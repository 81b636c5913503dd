//! HTTP transport seam.
//!
//! The crate never performs I/O itself. Callers plug in an [`HttpTransport`]
//! implementation (reqwest, hyper, a test double) that accepts a
//! [`PreparedRequest`] and either returns a [`TransportResponse`] or fails
//! with a [`TransportError`]. Retryability of a failure is decided here so
//! the engine and the gateway agree on classification.

use crate::request::PreparedRequest;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Transport-level failure codes the classifier recognizes.
///
/// These mirror the usual socket/DNS failure modes surfaced by HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportCode {
    /// Connection reset by peer.
    ConnectionReset,
    /// Connect or read timed out.
    TimedOut,
    /// Connection refused.
    ConnectionRefused,
    /// Host could not be resolved.
    HostNotFound,
    /// Temporary DNS failure (EAI_AGAIN).
    DnsTemporaryFailure,
}

impl TransportCode {
    /// All recognized codes are transient network conditions.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Successful transport result: status line, parsed body, headers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub data: Value,
    pub headers: HashMap<String, String>,
}

impl TransportResponse {
    pub fn new(status: u16, data: Value) -> Self {
        Self { status, status_text: String::new(), data, headers: HashMap::new() }
    }
}

/// Transport-level failure.
///
/// Carries the response status and body when the server answered with an
/// error status, or a [`TransportCode`] when the failure happened below HTTP.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
    pub status: Option<u16>,
    pub code: Option<TransportCode>,
    pub message: String,
    pub data: Option<Value>,
    /// Set when the in-flight call was aborted by a cancellation token.
    pub cancelled: bool,
}

impl TransportError {
    /// Failure derived from an HTTP error status.
    pub fn from_status(status: u16, data: Value) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: format!("request failed with status {}", status),
            data: Some(data),
            cancelled: false,
        }
    }

    /// Failure below HTTP (socket, DNS).
    pub fn from_code(code: TransportCode, message: impl Into<String>) -> Self {
        Self { status: None, code: Some(code), message: message.into(), data: None, cancelled: false }
    }

    /// Failure caused by cancellation.
    pub fn cancelled() -> Self {
        Self {
            status: None,
            code: None,
            message: "request cancelled".to_string(),
            data: None,
            cancelled: true,
        }
    }

    /// Whether a retry has any chance of succeeding.
    ///
    /// Retryable when the status is 408, 409, 429 or any 5xx, or when the
    /// transport code names a transient network condition. Cancelled calls
    /// are never retryable.
    pub fn is_retryable(&self) -> bool {
        if self.cancelled {
            return false;
        }
        if let Some(status) = self.status {
            return retryable_status(status);
        }
        self.code.map(|c| c.is_retryable()).unwrap_or(false)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancelled {
            return write!(f, "transport call cancelled");
        }
        match (self.status, self.code) {
            (Some(status), _) => write!(f, "transport error: status {} ({})", status, self.message),
            (None, Some(code)) => write!(f, "transport error: {:?} ({})", code, self.message),
            (None, None) => write!(f, "transport error: {}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Status-based half of the retry classifier.
pub fn retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429) || status >= 500
}

/// Pluggable HTTP client.
///
/// Implementations must honor `request.timeout` and should map their native
/// error types onto [`TransportError`] (status for HTTP errors, code for
/// network errors, `cancelled` for aborts).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportError>;
}
