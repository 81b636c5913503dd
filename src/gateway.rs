//! The gateway batcher.
//!
//! [`stable_api_gateway`] runs a flat batch of items (declared requests or
//! arbitrary functions) and returns one [`GatewayResponse`] per item. Item
//! failures never fail the batch. Per-item execution is wrapped by the
//! shared infrastructure in a fixed order: circuit-breaker guard, rate
//! limiter, concurrency limiter, cache lookup, engine, cache write. A
//! breaker rejection produces a failed response without consuming any other
//! resource.
//!
//! Policy values resolve item-local over group-common over gateway-common
//! over built-in defaults.

use crate::buffer::StableBuffer;
use crate::cache::{request_fingerprint, CacheManager, CachedResponse, FunctionCacheManager};
use crate::circuit_breaker::CircuitBreaker;
use crate::concurrency::{ConcurrencyError, ConcurrencyLimiter};
use crate::error::{BoxError, RequestError};
use crate::jitter::Jitter;
use crate::rate_limiter::{RateLimitError, RateLimiter};
use crate::request::Request;
use crate::retry::RetryStrategy;
use crate::stable_request::{
    execute_with_observer, AttemptObserver, CallOutcome, ErrorHook, FinalErrorAnalyzer,
    RequestPolicy, ResponseAnalyzer, StableRequestSpec, SuccessHook, TrialConfig,
};
use crate::time::Sleeper;
use crate::transport::HttpTransport;
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A function item: receives the gateway context, returns a JSON value.
pub type GatewayFunction =
    Arc<dyn Fn(GatewayContext) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Ambient state handed to function items.
#[derive(Debug, Clone, Default)]
pub struct GatewayContext {
    pub shared_buffer: Option<StableBuffer>,
}

/// Item discriminator carried on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GatewayItemKind {
    Request,
    Function,
}

/// Optional per-item or per-group policy values; unset fields fall through
/// to the next precedence level.
#[derive(Clone, Default)]
pub struct PolicyOverrides {
    pub attempts: Option<u32>,
    pub perform_all_attempts: Option<bool>,
    pub wait: Option<Duration>,
    pub retry_strategy: Option<RetryStrategy>,
    pub jitter: Option<Jitter>,
    pub max_allowed_wait: Option<Duration>,
    pub res_req: Option<bool>,
    pub response_analyzer: Option<ResponseAnalyzer>,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
    pub handle_errors: Option<ErrorHook>,
    pub handle_successful_attempt_data: Option<SuccessHook>,
    pub log_all_errors: Option<bool>,
    pub log_all_successful_attempts: Option<bool>,
    pub max_serializable_chars: Option<usize>,
    pub trial: Option<TrialConfig>,
    pub sleeper: Option<Arc<dyn Sleeper>>,
}

impl fmt::Debug for PolicyOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyOverrides")
            .field("attempts", &self.attempts)
            .field("wait", &self.wait)
            .field("retry_strategy", &self.retry_strategy)
            .field("res_req", &self.res_req)
            .field("trial", &self.trial)
            .finish()
    }
}

impl PolicyOverrides {
    /// Apply every set field onto `base`. This is the single option-mapping
    /// table; precedence comes from application order.
    pub fn overlay(&self, mut base: RequestPolicy) -> RequestPolicy {
        if let Some(v) = self.attempts {
            base.attempts = v;
        }
        if let Some(v) = self.perform_all_attempts {
            base.perform_all_attempts = v;
        }
        if let Some(v) = self.wait {
            base.wait = v;
        }
        if let Some(v) = self.retry_strategy {
            base.retry_strategy = v;
        }
        if let Some(v) = self.jitter {
            base.jitter = v;
        }
        if let Some(v) = self.max_allowed_wait {
            base.max_allowed_wait = v;
        }
        if let Some(v) = self.res_req {
            base.res_req = v;
        }
        if let Some(v) = &self.response_analyzer {
            base.response_analyzer = Some(v.clone());
        }
        if let Some(v) = &self.final_error_analyzer {
            base.final_error_analyzer = Some(v.clone());
        }
        if let Some(v) = &self.handle_errors {
            base.handle_errors = Some(v.clone());
        }
        if let Some(v) = &self.handle_successful_attempt_data {
            base.handle_successful_attempt_data = Some(v.clone());
        }
        if let Some(v) = self.log_all_errors {
            base.log_all_errors = v;
        }
        if let Some(v) = self.log_all_successful_attempts {
            base.log_all_successful_attempts = v;
        }
        if let Some(v) = self.max_serializable_chars {
            base.max_serializable_chars = v;
        }
        if let Some(v) = &self.trial {
            base.trial = Some(v.clone());
        }
        if let Some(v) = &self.sleeper {
            base.sleeper = v.clone();
        }
        base
    }

    /// Layer these overrides on top of `weaker`: set fields here win, unset
    /// fields fall through.
    pub fn merged_over(&self, weaker: &PolicyOverrides) -> PolicyOverrides {
        PolicyOverrides {
            attempts: self.attempts.or(weaker.attempts),
            perform_all_attempts: self.perform_all_attempts.or(weaker.perform_all_attempts),
            wait: self.wait.or(weaker.wait),
            retry_strategy: self.retry_strategy.or(weaker.retry_strategy),
            jitter: self.jitter.or(weaker.jitter),
            max_allowed_wait: self.max_allowed_wait.or(weaker.max_allowed_wait),
            res_req: self.res_req.or(weaker.res_req),
            response_analyzer: self
                .response_analyzer
                .clone()
                .or_else(|| weaker.response_analyzer.clone()),
            final_error_analyzer: self
                .final_error_analyzer
                .clone()
                .or_else(|| weaker.final_error_analyzer.clone()),
            handle_errors: self.handle_errors.clone().or_else(|| weaker.handle_errors.clone()),
            handle_successful_attempt_data: self
                .handle_successful_attempt_data
                .clone()
                .or_else(|| weaker.handle_successful_attempt_data.clone()),
            log_all_errors: self.log_all_errors.or(weaker.log_all_errors),
            log_all_successful_attempts: self
                .log_all_successful_attempts
                .or(weaker.log_all_successful_attempts),
            max_serializable_chars: self.max_serializable_chars.or(weaker.max_serializable_chars),
            trial: self.trial.clone().or_else(|| weaker.trial.clone()),
            sleeper: self.sleeper.clone().or_else(|| weaker.sleeper.clone()),
        }
    }
}

/// A named group sharing common policy values.
#[derive(Debug, Clone)]
pub struct RequestGroup {
    pub id: String,
    pub common: PolicyOverrides,
}

/// One batch item.
#[derive(Clone)]
pub enum GatewayItem {
    Request {
        id: String,
        group_id: Option<String>,
        request: Request,
        policy: PolicyOverrides,
    },
    Function {
        id: String,
        group_id: Option<String>,
        function: GatewayFunction,
        /// Key into the function cache; uncached when absent.
        cache_key: Option<String>,
    },
}

impl GatewayItem {
    pub fn request(id: impl Into<String>, request: Request) -> Self {
        Self::Request {
            id: id.into(),
            group_id: None,
            request,
            policy: PolicyOverrides::default(),
        }
    }

    pub fn function(id: impl Into<String>, function: GatewayFunction) -> Self {
        Self::Function { id: id.into(), group_id: None, function, cache_key: None }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        match &mut self {
            Self::Request { group_id, .. } | Self::Function { group_id, .. } => {
                *group_id = Some(group.into());
            }
        }
        self
    }

    pub fn with_policy(mut self, overrides: PolicyOverrides) -> Self {
        if let Self::Request { policy, .. } = &mut self {
            *policy = overrides;
        }
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        if let Self::Function { cache_key, .. } = &mut self {
            *cache_key = Some(key.into());
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Request { id, .. } | Self::Function { id, .. } => id,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Request { group_id, .. } | Self::Function { group_id, .. } => {
                group_id.as_deref()
            }
        }
    }

    fn kind(&self) -> GatewayItemKind {
        match self {
            Self::Request { .. } => GatewayItemKind::Request,
            Self::Function { .. } => GatewayItemKind::Function,
        }
    }
}

impl fmt::Debug for GatewayItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request { id, group_id, .. } => f
                .debug_struct("GatewayItem::Request")
                .field("id", id)
                .field("group_id", group_id)
                .finish(),
            Self::Function { id, group_id, .. } => f
                .debug_struct("GatewayItem::Function")
                .field("id", id)
                .field("group_id", group_id)
                .finish(),
        }
    }
}

/// Batch-level options and shared infrastructure handles.
#[derive(Clone, Default)]
pub struct GatewayOptions {
    pub common_policy: PolicyOverrides,
    pub request_groups: Vec<RequestGroup>,
    /// `None` means the default: concurrent.
    pub concurrent_execution: Option<bool>,
    pub stop_on_first_error: bool,
    pub circuit_breaker: Option<CircuitBreaker>,
    pub rate_limiter: Option<RateLimiter>,
    pub concurrency_limiter: Option<ConcurrencyLimiter>,
    pub cache: Option<CacheManager>,
    pub function_cache: Option<FunctionCacheManager>,
    pub shared_buffer: Option<StableBuffer>,
}

impl GatewayOptions {
    pub fn is_concurrent(&self) -> bool {
        self.concurrent_execution.unwrap_or(true)
    }

    fn group(&self, id: Option<&str>) -> Option<&RequestGroup> {
        id.and_then(|id| self.request_groups.iter().find(|g| g.id == id))
    }

    /// Resolve the effective policy for one item.
    pub fn resolve_policy(
        &self,
        group_id: Option<&str>,
        item: &PolicyOverrides,
    ) -> RequestPolicy {
        let mut policy = self.common_policy.overlay(RequestPolicy::default());
        if let Some(group) = self.group(group_id) {
            policy = group.common.overlay(policy);
        }
        item.overlay(policy)
    }
}

/// Failure attached to an unsuccessful [`GatewayResponse`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    Request(RequestError),
    Function(String),
    RateLimiter(RateLimitError),
    Concurrency(ConcurrencyError),
}

impl GatewayError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Request(e) if e.is_circuit_open())
    }

    pub fn as_request_error(&self) -> Option<&RequestError> {
        match self {
            Self::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => write!(f, "{}", e),
            Self::Function(reason) => write!(f, "function item failed: {}", reason),
            Self::RateLimiter(e) => write!(f, "{}", e),
            Self::Concurrency(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Per-item batch result, indexed by input position.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub request_id: String,
    pub group_id: Option<String>,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<GatewayError>,
    pub kind: GatewayItemKind,
    pub elapsed: Duration,
}

impl GatewayResponse {
    fn ok(item: &GatewayItem, data: Option<Value>, elapsed: Duration) -> Self {
        Self {
            request_id: item.id().to_string(),
            group_id: item.group_id().map(String::from),
            success: true,
            data,
            error: None,
            kind: item.kind(),
            elapsed,
        }
    }

    fn failed(item: &GatewayItem, error: GatewayError, elapsed: Duration) -> Self {
        Self {
            request_id: item.id().to_string(),
            group_id: item.group_id().map(String::from),
            success: false,
            data: None,
            error: Some(error),
            kind: item.kind(),
            elapsed,
        }
    }
}

/// Execute a batch. Items start in input order; with concurrent execution
/// the response vector is still indexed by input position. Sequential
/// execution stops at the first failed item when `stop_on_first_error` is
/// set.
pub async fn stable_api_gateway(
    transport: &dyn HttpTransport,
    items: Vec<GatewayItem>,
    options: &GatewayOptions,
) -> Vec<GatewayResponse> {
    if options.is_concurrent() {
        let futures: Vec<_> =
            items.iter().map(|item| run_item(transport, item, options)).collect();
        join_all(futures).await
    } else {
        let mut responses = Vec::with_capacity(items.len());
        for item in &items {
            let response = run_item(transport, item, options).await;
            let failed = !response.success;
            responses.push(response);
            if failed && options.stop_on_first_error {
                tracing::info!(
                    completed = responses.len(),
                    total = items.len(),
                    "stopping batch on first error"
                );
                break;
            }
        }
        responses
    }
}

async fn run_item(
    transport: &dyn HttpTransport,
    item: &GatewayItem,
    options: &GatewayOptions,
) -> GatewayResponse {
    let started = Instant::now();

    // Breaker guard comes first: a rejection must not consume a rate-limit
    // token, a concurrency slot, or a cache read.
    if let Some(breaker) = &options.circuit_breaker {
        if !breaker.can_execute() {
            tracing::debug!(item = item.id(), "circuit breaker rejected item");
            return GatewayResponse::failed(
                item,
                GatewayError::Request(breaker.rejection()),
                started.elapsed(),
            );
        }
    }

    let result = guarded_item(transport, item, options).await;
    let elapsed = started.elapsed();

    // The breaker observes the outer result unless the engine already fed
    // it attempt by attempt.
    if let Some(breaker) = &options.circuit_breaker {
        let tracked_per_attempt = breaker.config().track_individual_attempts
            && matches!(item, GatewayItem::Request { .. });
        if !tracked_per_attempt {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }
    }

    match result {
        Ok(data) => GatewayResponse::ok(item, data, elapsed),
        Err(error) => GatewayResponse::failed(item, error, elapsed),
    }
}

/// Everything behind the breaker guard: limiters, cache, the engine.
async fn guarded_item(
    transport: &dyn HttpTransport,
    item: &GatewayItem,
    options: &GatewayOptions,
) -> Result<Option<Value>, GatewayError> {
    if let Some(limiter) = &options.rate_limiter {
        limiter.acquire().await.map_err(GatewayError::RateLimiter)?;
    }
    let _permit = match &options.concurrency_limiter {
        Some(limiter) => Some(limiter.acquire().await.map_err(GatewayError::Concurrency)?),
        None => None,
    };

    match item {
        GatewayItem::Request { group_id, request, policy, .. } => {
            let policy = options.resolve_policy(group_id.as_deref(), policy);

            let fingerprint =
                options.cache.as_ref().map(|_| request_fingerprint(request));
            if let (Some(cache), Some(key)) = (&options.cache, &fingerprint) {
                if let Some(entry) = cache.get(key) {
                    tracing::debug!(item = item.id(), "serving response from cache");
                    return Ok(policy.res_req.then(|| entry.value.data));
                }
            }

            let spec = StableRequestSpec { request: request.clone(), policy };
            let observer: Option<&dyn AttemptObserver> = match &options.circuit_breaker {
                Some(breaker) if breaker.config().track_individual_attempts => {
                    Some(breaker as &dyn AttemptObserver)
                }
                _ => None,
            };
            let outcome = execute_with_observer(transport, &spec, observer)
                .await
                .map_err(GatewayError::Request)?;

            match outcome {
                CallOutcome::Body(data) => {
                    if let (Some(cache), Some(key)) = (&options.cache, &fingerprint) {
                        cache.set(
                            key.clone(),
                            CachedResponse {
                                data: data.clone(),
                                status: 200,
                                status_text: String::new(),
                                headers: Default::default(),
                            },
                        );
                    }
                    Ok(Some(data))
                }
                CallOutcome::Completed | CallOutcome::Suppressed => Ok(None),
            }
        }
        GatewayItem::Function { function, cache_key, .. } => {
            if let (Some(cache), Some(key)) = (&options.function_cache, cache_key) {
                if let Some(entry) = cache.get(key) {
                    tracing::debug!(item = item.id(), "serving function result from cache");
                    return Ok(Some(entry.value));
                }
            }

            let context = GatewayContext { shared_buffer: options.shared_buffer.clone() };
            let value = function(context)
                .await
                .map_err(|e| GatewayError::Function(e.to_string()))?;

            if let (Some(cache), Some(key)) = (&options.function_cache, cache_key) {
                cache.set(key.clone(), value.clone());
            }
            Ok(Some(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::rate_limiter::RateLimitConfig;
    use crate::request::Method;
    use crate::time::InstantSleeper;
    use crate::transport::{TransportError, TransportResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport answering per-path scripted statuses; defaults to 200.
    struct PathTransport {
        statuses: Mutex<HashMap<String, Vec<u16>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl PathTransport {
        fn ok() -> Self {
            Self {
                statuses: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        fn with_script(path: &str, statuses: Vec<u16>) -> Self {
            let transport = Self::ok();
            transport.statuses.lock().unwrap().insert(path.to_string(), statuses);
            transport
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for PathTransport {
        async fn send(
            &self,
            request: &crate::request::PreparedRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let status = {
                let mut statuses = self.statuses.lock().unwrap();
                match statuses.get_mut(&request.url) {
                    Some(script) if !script.is_empty() => script.remove(0),
                    _ => 200,
                }
            };
            if status < 400 {
                Ok(TransportResponse::new(status, json!({"path": request.url})))
            } else {
                Err(TransportError::from_status(status, Value::Null))
            }
        }
    }

    fn req_item(id: &str, path: &str) -> GatewayItem {
        GatewayItem::request(
            id,
            Request::builder("api.example.com").method(Method::Get).path(path).build(),
        )
    }

    fn base_options() -> GatewayOptions {
        GatewayOptions {
            common_policy: PolicyOverrides {
                res_req: Some(true),
                sleeper: Some(Arc::new(InstantSleeper)),
                wait: Some(Duration::from_millis(1)),
                ..PolicyOverrides::default()
            },
            ..GatewayOptions::default()
        }
    }

    #[tokio::test]
    async fn responses_are_indexed_by_input_position() {
        let transport = PathTransport::ok();
        let items = vec![req_item("a", "/1"), req_item("b", "/2"), req_item("c", "/3")];
        let responses = stable_api_gateway(&transport, items, &base_options()).await;

        assert_eq!(responses.len(), 3);
        let ids: Vec<_> = responses.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(responses.iter().all(|r| r.success));
        assert!(responses.iter().all(|r| r.kind == GatewayItemKind::Request));
    }

    #[tokio::test]
    async fn item_failure_does_not_fail_batch() {
        let transport = PathTransport::with_script("/bad", vec![404]);
        let items = vec![req_item("good", "/ok"), req_item("bad", "/bad")];
        let responses = stable_api_gateway(&transport, items, &base_options()).await;

        assert!(responses[0].success);
        assert!(!responses[1].success);
        assert!(matches!(
            responses[1].error,
            Some(GatewayError::Request(RequestError::Aborted { .. }))
        ));
    }

    #[tokio::test]
    async fn sequential_stop_on_first_error() {
        let transport = PathTransport::with_script("/bad", vec![404]);
        let items =
            vec![req_item("a", "/ok"), req_item("b", "/bad"), req_item("c", "/never")];
        let options = GatewayOptions {
            concurrent_execution: Some(false),
            stop_on_first_error: true,
            ..base_options()
        };
        let responses = stable_api_gateway(&transport, items, &options).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn policy_precedence_item_over_group_over_common() {
        let options = GatewayOptions {
            common_policy: PolicyOverrides {
                attempts: Some(2),
                wait: Some(Duration::from_millis(10)),
                res_req: Some(false),
                ..PolicyOverrides::default()
            },
            request_groups: vec![RequestGroup {
                id: "g".into(),
                common: PolicyOverrides {
                    attempts: Some(5),
                    res_req: Some(true),
                    ..PolicyOverrides::default()
                },
            }],
            ..GatewayOptions::default()
        };

        // Item overrides win over group and common.
        let item = PolicyOverrides { attempts: Some(9), ..PolicyOverrides::default() };
        let resolved = options.resolve_policy(Some("g"), &item);
        assert_eq!(resolved.attempts, 9);
        assert!(resolved.res_req); // from group
        assert_eq!(resolved.wait, Duration::from_millis(10)); // from common

        // Without a group, common applies beneath the item.
        let resolved = options.resolve_policy(None, &PolicyOverrides::default());
        assert_eq!(resolved.attempts, 2);
        assert!(!resolved.res_req);

        // Unknown group ids fall through to common.
        let resolved = options.resolve_policy(Some("missing"), &PolicyOverrides::default());
        assert_eq!(resolved.attempts, 2);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_consuming_resources() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            minimum_requests: 1,
            failure_threshold_pct: 1.0,
            ..CircuitBreakerConfig::default()
        })
        .unwrap();
        breaker.record_failure(); // trips immediately

        let limiter = RateLimiter::new(
            RateLimitConfig::new(10, Duration::from_secs(60)).unwrap(),
        );
        let transport = PathTransport::ok();
        let options = GatewayOptions {
            circuit_breaker: Some(breaker),
            rate_limiter: Some(limiter.clone()),
            ..base_options()
        };

        let responses =
            stable_api_gateway(&transport, vec![req_item("a", "/x")], &options).await;
        assert!(!responses[0].success);
        assert!(responses[0].error.as_ref().unwrap().is_circuit_open());
        assert_eq!(transport.calls(), 0);
        assert_eq!(limiter.available_tokens(), 10, "rejection must not consume a token");
    }

    #[tokio::test]
    async fn breaker_records_outer_results() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            minimum_requests: 100,
            ..CircuitBreakerConfig::default()
        })
        .unwrap();
        let transport = PathTransport::with_script("/bad", vec![404]);
        let options = GatewayOptions {
            circuit_breaker: Some(breaker.clone()),
            ..base_options()
        };

        stable_api_gateway(
            &transport,
            vec![req_item("good", "/ok"), req_item("bad", "/bad")],
            &options,
        )
        .await;

        let counters = breaker.counters();
        assert_eq!(counters.total_requests, 2);
        assert_eq!(counters.successful_requests, 1);
        assert_eq!(counters.failed_requests, 1);
    }

    #[tokio::test]
    async fn breaker_tracks_individual_attempts_when_configured() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            minimum_requests: 100,
            track_individual_attempts: true,
            ..CircuitBreakerConfig::default()
        })
        .unwrap();
        // Two retryable failures then success: three attempts total.
        let transport = PathTransport::with_script("/flaky", vec![500, 500, 200]);
        let options = GatewayOptions {
            circuit_breaker: Some(breaker.clone()),
            ..base_options()
        };

        let responses =
            stable_api_gateway(&transport, vec![req_item("a", "/flaky")], &options).await;
        assert!(responses[0].success);

        let counters = breaker.counters();
        assert_eq!(counters.total_requests, 3);
        assert_eq!(counters.failed_requests, 2);
        assert_eq!(counters.successful_requests, 1);
    }

    #[tokio::test]
    async fn concurrency_limiter_caps_in_flight_requests() {
        let transport = PathTransport::ok();
        let options = GatewayOptions {
            concurrency_limiter: Some(ConcurrencyLimiter::new(2).unwrap()),
            ..base_options()
        };
        let items: Vec<_> = (0..6).map(|i| req_item(&format!("r{}", i), "/x")).collect();
        let responses = stable_api_gateway(&transport, items, &options).await;

        assert!(responses.iter().all(|r| r.success));
        assert!(transport.peak_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cache_hit_skips_transport() {
        let transport = PathTransport::ok();
        let cache = CacheManager::new(CacheConfig::default());
        let options = GatewayOptions { cache: Some(cache.clone()), ..base_options() };

        let first =
            stable_api_gateway(&transport, vec![req_item("a", "/cached")], &options).await;
        assert!(first[0].success);
        assert_eq!(transport.calls(), 1);

        let second =
            stable_api_gateway(&transport, vec![req_item("b", "/cached")], &options).await;
        assert!(second[0].success);
        assert_eq!(second[0].data, first[0].data);
        assert_eq!(transport.calls(), 1, "second call must be served from cache");
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn function_items_run_and_cache() {
        let transport = PathTransport::ok();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let function: GatewayFunction = Arc::new(move |_ctx| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"computed": 7}))
            })
        });

        let function_cache = FunctionCacheManager::new(CacheConfig::default());
        let options = GatewayOptions {
            function_cache: Some(function_cache.clone()),
            ..GatewayOptions::default()
        };

        let item = GatewayItem::function("f", function).with_cache_key("f-key");
        let first = stable_api_gateway(&transport, vec![item.clone()], &options).await;
        assert!(first[0].success);
        assert_eq!(first[0].data, Some(json!({"computed": 7})));
        assert_eq!(first[0].kind, GatewayItemKind::Function);

        let second = stable_api_gateway(&transport, vec![item], &options).await;
        assert_eq!(second[0].data, Some(json!({"computed": 7})));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second run served from cache");
    }

    #[tokio::test]
    async fn function_failure_is_reported() {
        let transport = PathTransport::ok();
        let function: GatewayFunction =
            Arc::new(|_ctx| Box::pin(async { Err("exploded".into()) }));
        let responses = stable_api_gateway(
            &transport,
            vec![GatewayItem::function("f", function)],
            &GatewayOptions::default(),
        )
        .await;

        assert!(!responses[0].success);
        assert!(matches!(
            &responses[0].error,
            Some(GatewayError::Function(reason)) if reason.contains("exploded")
        ));
    }

    #[tokio::test]
    async fn functions_see_the_shared_buffer() {
        let transport = PathTransport::ok();
        let buffer = StableBuffer::default();
        let function: GatewayFunction = Arc::new(|ctx| {
            Box::pin(async move {
                let buffer = ctx.shared_buffer.expect("buffer wired");
                buffer
                    .run(|state| {
                        Box::pin(async move {
                            state.insert("from_fn".into(), json!(true));
                        })
                    })
                    .await
                    .map_err(|e| -> BoxError { Box::new(e) })?;
                Ok(json!(null))
            })
        });

        let options = GatewayOptions {
            shared_buffer: Some(buffer.clone()),
            ..GatewayOptions::default()
        };
        let responses = stable_api_gateway(
            &transport,
            vec![GatewayItem::function("f", function)],
            &options,
        )
        .await;
        assert!(responses[0].success);
        assert_eq!(buffer.get("from_fn").await, Some(json!(true)));
    }
}
