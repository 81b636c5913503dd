#![forbid(unsafe_code)]

//! # Stable Gateway
//!
//! Resilient outbound-HTTP orchestration for async Rust: declare requests
//! with per-call reliability policies, batch them through a gateway, and
//! compose batches into phases, branches and workflow graphs.
//!
//! ## Features
//!
//! - **Per-call retry engine** with fixed/linear/exponential backoff,
//!   jitter, response analyzers and failure suppression
//! - **Circuit breaker** with failure-rate thresholds and half-open probing
//! - **Token-bucket rate limiter** and **FIFO concurrency limiter**
//! - **Response and function caches** with TTL and LRU eviction
//! - **Workflow graphs** of phase/branch/conditional/parallel/merge nodes
//! - **Transactional state buffer** with snapshot persistence
//! - **Pluggable distributed coordination** (locks, pub/sub, leader election)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stable_gateway::{
//!     stable_api_gateway, GatewayItem, GatewayOptions, PolicyOverrides, Request,
//!     RetryStrategy,
//! };
//! # use async_trait::async_trait;
//! # struct MyClient;
//! # #[async_trait]
//! # impl stable_gateway::HttpTransport for MyClient {
//! #     async fn send(
//! #         &self,
//! #         _request: &stable_gateway::PreparedRequest,
//! #     ) -> Result<stable_gateway::TransportResponse, stable_gateway::TransportError> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MyClient;
//!
//!     let items = vec![
//!         GatewayItem::request("users", Request::builder("api.example.com").path("/users").build()),
//!         GatewayItem::request("posts", Request::builder("api.example.com").path("/posts").build()),
//!     ];
//!     let options = GatewayOptions {
//!         common_policy: PolicyOverrides {
//!             attempts: Some(3),
//!             wait: Some(Duration::from_millis(200)),
//!             retry_strategy: Some(RetryStrategy::Exponential),
//!             res_req: Some(true),
//!             ..PolicyOverrides::default()
//!         },
//!         ..GatewayOptions::default()
//!     };
//!
//!     let responses = stable_api_gateway(&transport, items, &options).await;
//!     for response in responses {
//!         println!("{}: success={}", response.request_id, response.success);
//!     }
//! }
//! ```

mod buffer;
mod cache;
mod circuit_breaker;
mod concurrency;
pub mod distributed;
mod error;
mod gateway;
mod jitter;
mod metrics;
mod persistence;
mod rate_limiter;
mod request;
mod retry;
mod stable_request;
mod time;
mod transport;
pub mod workflow;

// Re-exports
pub use buffer::{
    BufferConfig, BufferError, BufferState, StableBuffer, TransactionRecord, TransactionStatus,
};
pub use cache::{
    request_fingerprint, CacheConfig, CacheEntry, CacheManager, CacheSnapshot, CacheStats,
    CachedResponse, FunctionCacheManager, TtlLruCache, DEFAULT_CACHE_MAX_SIZE,
    DEFAULT_CACHE_TTL,
};
pub use circuit_breaker::{
    BreakerCounters, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigError,
    CircuitBreakerSnapshot, CircuitState, StateTransition,
};
pub use concurrency::{
    ConcurrencyConfigError, ConcurrencyError, ConcurrencyLimiter, ConcurrencyLimiterSnapshot,
    ConcurrencyPermit,
};
pub use error::{AttemptError, BoxError, RequestError, MAX_ATTEMPT_FAILURES};
pub use gateway::{
    stable_api_gateway, GatewayContext, GatewayError, GatewayFunction, GatewayItem,
    GatewayItemKind, GatewayOptions, GatewayResponse, PolicyOverrides, RequestGroup,
};
pub use jitter::Jitter;
pub use metrics::{BatchMetrics, GuardrailViolation, MetricsGuardrails};
pub use persistence::{
    InfraSnapshot, PersistedDocument, PersistenceBackend, PersistenceCoordinator,
};
pub use rate_limiter::{
    RateLimitConfig, RateLimitConfigError, RateLimitError, RateLimiter, RateLimiterMetrics,
    RateLimiterSnapshot,
};
pub use request::{
    CancelToken, Method, PreparedRequest, Protocol, Request, RequestBuildError, RequestBuilder,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use retry::{RetrySchedule, RetryStrategy, MAX_ALLOWED_WAIT};
pub use stable_request::{
    execute_with_observer, stable_request, AttemptObserver, CallOutcome, ErrorHook, ErrorLog,
    FinalErrorAnalyzer, RequestPolicy, ResponseAnalyzer, StableRequestSpec, SuccessHook,
    SuccessLog, TrialConfig, DEFAULT_MAX_SERIALIZABLE_CHARS,
};
pub use time::{
    Clock, InstantSleeper, ManualClock, MonotonicClock, Sleeper, SystemClock, TokioSleeper,
    TrackingSleeper,
};
pub use transport::{
    retryable_status, HttpTransport, TransportCode, TransportError, TransportResponse,
};

pub mod prelude;
