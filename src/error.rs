//! Error types for the request engine and the gateway.

use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside `Exhausted` to avoid unbounded growth.
pub const MAX_ATTEMPT_FAILURES: usize = 10;

/// Boxed error type used by user-supplied hooks and analyzers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of one attempt inside the request engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// The transport failed or the server answered with an error status.
    Transport(TransportError),
    /// The transport succeeded but the response analyzer rejected the body.
    InvalidContent { status: u16, reason: String },
    /// The response analyzer itself failed; treated as a rejection.
    AnalyzerFailed { reason: String },
    /// Synthetic trial-mode failure.
    Trial { retryable: bool },
}

impl AttemptError {
    /// Whether the engine may try again after this failure.
    ///
    /// Analyzer-driven failures always retry: the server answered, so a
    /// later attempt can answer differently.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::InvalidContent { .. } | Self::AnalyzerFailed { .. } => true,
            Self::Trial { retryable } => *retryable,
        }
    }

    /// HTTP status associated with this failure, when known.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status,
            Self::InvalidContent { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::InvalidContent { status, reason } => {
                write!(f, "response rejected by analyzer (status {}): {}", status, reason)
            }
            Self::AnalyzerFailed { reason } => write!(f, "response analyzer failed: {}", reason),
            Self::Trial { retryable } => {
                write!(f, "trial-mode failure (retryable: {})", retryable)
            }
        }
    }
}

impl std::error::Error for AttemptError {}

/// Final failure of a gateway item or a `stable_request` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Every attempt failed and the budget is spent.
    Exhausted { attempts: u32, failures: Vec<AttemptError> },
    /// A non-retryable failure stopped the loop early.
    Aborted { attempt: u32, failure: AttemptError },
    /// The circuit breaker rejected the item before dispatch.
    CircuitOpen { failed: u64, total: u64 },
    /// The phase or request exceeded its budget.
    Timeout { elapsed: Duration, limit: Duration },
    /// The cancellation token fired.
    Cancelled,
    /// The call specification is invalid (e.g. a probability out of range).
    InvalidSpec { reason: String },
}

impl RequestError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Access recorded attempt failures, if present.
    pub fn failures(&self) -> Option<&[AttemptError]> {
        match self {
            Self::Exhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The last attempt failure, if this error carries one.
    pub fn last_failure(&self) -> Option<&AttemptError> {
        match self {
            Self::Exhausted { failures, .. } => failures.last(),
            Self::Aborted { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "attempts exhausted after {} tries ({} failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Aborted { attempt, failure } => {
                write!(f, "non-retryable failure on attempt {}: {}", attempt, failure)
            }
            Self::CircuitOpen { failed, total } => {
                write!(f, "circuit breaker open ({} of {} requests failed)", failed, total)
            }
            Self::Timeout { elapsed, limit } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, limit)
            }
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::InvalidSpec { reason } => write!(f, "invalid request spec: {}", reason),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::Aborted { failure, .. } => Some(failure),
            _ => None,
        }
    }
}
