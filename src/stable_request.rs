//! The per-call retry engine.
//!
//! [`stable_request`] drives one declared call through its attempt budget:
//! dispatch (or a simulated trial-mode outcome), response analysis, failure
//! classification, backoff, and final disposition. User-supplied analyzers
//! and hooks are invoked through a guard that logs their failures instead of
//! surfacing them.

use crate::error::{AttemptError, BoxError, RequestError, MAX_ATTEMPT_FAILURES};
use crate::jitter::Jitter;
use crate::request::Request;
use crate::retry::{RetrySchedule, RetryStrategy, MAX_ALLOWED_WAIT};
use crate::time::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::transport::HttpTransport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default serialized-payload budget for log records.
pub const DEFAULT_MAX_SERIALIZABLE_CHARS: usize = 1000;

/// Inspects a transport-successful response body; `false` demotes the
/// attempt to a retryable failure. The final `bool` argument reports trial
/// mode.
pub type ResponseAnalyzer =
    Arc<dyn Fn(&Request, &Value, bool) -> Result<bool, BoxError> + Send + Sync>;

/// Consulted once after the final failure; `true` converts the failure into
/// [`CallOutcome::Suppressed`].
pub type FinalErrorAnalyzer =
    Arc<dyn Fn(&Request, &RequestError, bool) -> Result<bool, BoxError> + Send + Sync>;

/// Receives one [`ErrorLog`] per failing attempt when `log_all_errors` is set.
pub type ErrorHook = Arc<dyn Fn(&ErrorLog) -> Result<(), BoxError> + Send + Sync>;

/// Receives one [`SuccessLog`] per successful attempt when
/// `log_all_successful_attempts` is set.
pub type SuccessHook = Arc<dyn Fn(&SuccessLog) -> Result<(), BoxError> + Send + Sync>;

/// Per-attempt feed for the circuit breaker's individual-attempt tracking.
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, success: bool);
}

impl AttemptObserver for crate::circuit_breaker::CircuitBreaker {
    fn on_attempt(&self, success: bool) {
        if success {
            self.record_attempt_success();
        } else {
            self.record_attempt_failure();
        }
    }
}

/// Trial-mode configuration: attempts never reach the transport; outcomes
/// are drawn from the configured probabilities instead.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialConfig {
    /// Probability that the first attempt fails.
    pub req_failure_probability: f64,
    /// Probability that a retry attempt fails; also drawn for retryability
    /// of a failed attempt.
    pub retry_failure_probability: f64,
    /// Emit a log record with the final disposition.
    pub log_final_response: bool,
    /// Seed for deterministic draws in tests.
    pub seed: Option<u64>,
}

impl TrialConfig {
    pub fn new(req_failure_probability: f64, retry_failure_probability: f64) -> Self {
        Self {
            req_failure_probability,
            retry_failure_probability,
            log_final_response: false,
            seed: None,
        }
    }

    fn validate(&self) -> Result<(), RequestError> {
        for (name, p) in [
            ("req_failure_probability", self.req_failure_probability),
            ("retry_failure_probability", self.retry_failure_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(RequestError::InvalidSpec {
                    reason: format!("{} must be within [0, 1] (got {})", name, p),
                });
            }
        }
        Ok(())
    }
}

/// Per-call reliability policy.
#[derive(Clone)]
pub struct RequestPolicy {
    pub attempts: u32,
    /// Run the full attempt budget even after a success or a non-retryable
    /// failure.
    pub perform_all_attempts: bool,
    pub wait: Duration,
    pub retry_strategy: RetryStrategy,
    pub jitter: Jitter,
    pub max_allowed_wait: Duration,
    /// Return the response body to the caller on success.
    pub res_req: bool,
    pub response_analyzer: Option<ResponseAnalyzer>,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
    pub handle_errors: Option<ErrorHook>,
    pub handle_successful_attempt_data: Option<SuccessHook>,
    pub log_all_errors: bool,
    pub log_all_successful_attempts: bool,
    pub max_serializable_chars: usize,
    pub trial: Option<TrialConfig>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            perform_all_attempts: false,
            wait: Duration::from_millis(1000),
            retry_strategy: RetryStrategy::Fixed,
            jitter: Jitter::None,
            max_allowed_wait: MAX_ALLOWED_WAIT,
            res_req: false,
            response_analyzer: None,
            final_error_analyzer: None,
            handle_errors: None,
            handle_successful_attempt_data: None,
            log_all_errors: false,
            log_all_successful_attempts: false,
            max_serializable_chars: DEFAULT_MAX_SERIALIZABLE_CHARS,
            trial: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl std::fmt::Debug for RequestPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPolicy")
            .field("attempts", &self.attempts)
            .field("perform_all_attempts", &self.perform_all_attempts)
            .field("wait", &self.wait)
            .field("retry_strategy", &self.retry_strategy)
            .field("jitter", &self.jitter)
            .field("res_req", &self.res_req)
            .field("trial", &self.trial)
            .finish()
    }
}

impl RequestPolicy {
    fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            strategy: self.retry_strategy,
            wait: self.wait,
            jitter: self.jitter,
            max_allowed_wait: self.max_allowed_wait,
        }
    }
}

/// One declared call: the request plus its policy.
#[derive(Debug, Clone)]
pub struct StableRequestSpec {
    pub request: Request,
    pub policy: RequestPolicy,
}

/// Final disposition of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Success, body returned (`res_req`).
    Body(Value),
    /// Success, body not requested.
    Completed,
    /// Final failure converted to a handled failure by the final-error
    /// analyzer.
    Suppressed,
}

/// Record handed to the error hook for each failing attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLog {
    pub attempt: u32,
    pub timestamp: u64,
    pub execution_time: Duration,
    pub retryable: bool,
    pub status: Option<u16>,
    /// Serialized failure, truncated to `max_serializable_chars`.
    pub error: String,
    /// Serialized normalized request, truncated to `max_serializable_chars`.
    pub request: String,
}

/// Record handed to the success hook for each successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessLog {
    pub attempt: u32,
    pub timestamp: u64,
    pub execution_time: Duration,
    pub data: Value,
}

/// Execute one declared call through its policy.
pub async fn stable_request(
    transport: &dyn HttpTransport,
    spec: &StableRequestSpec,
) -> Result<CallOutcome, RequestError> {
    execute_with_observer(transport, spec, None).await
}

/// Engine entry point with a per-attempt observer (used by the gateway when
/// the circuit breaker tracks individual attempts).
pub async fn execute_with_observer(
    transport: &dyn HttpTransport,
    spec: &StableRequestSpec,
    observer: Option<&dyn AttemptObserver>,
) -> Result<CallOutcome, RequestError> {
    let policy = &spec.policy;
    if policy.attempts == 0 {
        return Err(RequestError::InvalidSpec { reason: "attempts must be >= 1".into() });
    }
    if let Some(trial) = &policy.trial {
        trial.validate()?;
    }
    let prepared = spec
        .request
        .prepare()
        .map_err(|e| RequestError::InvalidSpec { reason: e.to_string() })?;

    let schedule = policy.schedule();
    let clock = SystemClock;
    let trial_mode = policy.trial.is_some();
    let mut trial_rng = policy.trial.as_ref().and_then(|t| t.seed).map(StdRng::seed_from_u64);

    let mut failures: Vec<AttemptError> = Vec::new();
    let mut last_success_data: Option<Value> = None;
    let mut last_attempt_succeeded = false;

    for attempt in 1..=policy.attempts {
        if let Some(cancel) = &spec.request.cancel {
            if cancel.is_cancelled() {
                return Err(RequestError::Cancelled);
            }
        }

        let started = Instant::now();
        let timestamp = clock.now_millis();

        // Dispatch: simulated under trial mode, otherwise the transport
        // raced against the cancellation token.
        let attempt_result = match &policy.trial {
            Some(trial) => simulate_attempt(trial, attempt, &mut trial_rng),
            None => {
                let send = transport.send(&prepared);
                match &spec.request.cancel {
                    Some(cancel) => {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                Err(AttemptError::Transport(
                                    crate::transport::TransportError::cancelled(),
                                ))
                            }
                            result = send => result
                                .map(|r| r.data)
                                .map_err(AttemptError::Transport),
                        }
                    }
                    None => send.await.map(|r| r.data).map_err(AttemptError::Transport),
                }
            }
        };
        let execution_time = started.elapsed();

        // Abort the whole call on cancellation, skipping retries.
        if let Err(AttemptError::Transport(e)) = &attempt_result {
            if e.cancelled {
                return Err(RequestError::Cancelled);
            }
        }

        // Analyzer runs only on transport-level success.
        let outcome = match attempt_result {
            Ok(data) => match analyze(policy, &spec.request, &data, trial_mode) {
                Ok(()) => Ok(data),
                Err(failure) => Err(failure),
            },
            Err(failure) => Err(failure),
        };

        match outcome {
            Ok(data) => {
                last_attempt_succeeded = true;
                if let Some(observer) = observer {
                    observer.on_attempt(true);
                }
                if policy.log_all_successful_attempts {
                    if let Some(hook) = &policy.handle_successful_attempt_data {
                        let log = SuccessLog {
                            attempt,
                            timestamp,
                            execution_time,
                            data: data.clone(),
                        };
                        run_hook("handle_successful_attempt_data", || hook(&log));
                    }
                }
                last_success_data = Some(data);
                if !policy.perform_all_attempts {
                    break;
                }
            }
            Err(failure) => {
                last_attempt_succeeded = false;
                if let Some(observer) = observer {
                    observer.on_attempt(false);
                }
                let retryable = failure.is_retryable();
                if policy.log_all_errors {
                    if let Some(hook) = &policy.handle_errors {
                        let log = ErrorLog {
                            attempt,
                            timestamp,
                            execution_time,
                            retryable,
                            status: failure.status(),
                            error: serialize_truncated(
                                &failure.to_string(),
                                policy.max_serializable_chars,
                            ),
                            request: serialize_truncated(
                                &prepared,
                                policy.max_serializable_chars,
                            ),
                        };
                        run_hook("handle_errors", || hook(&log));
                    }
                }
                push_bounded(&mut failures, failure.clone());
                if !retryable && !policy.perform_all_attempts {
                    let error = RequestError::Aborted { attempt, failure };
                    return finish_failure(policy, &spec.request, error, trial_mode);
                }
            }
        }

        if attempt < policy.attempts {
            let delay = schedule.delay(attempt);
            tracing::debug!(attempt, ?delay, "retrying after backoff");
            policy.sleeper.sleep(delay).await;
        }
    }

    let succeeded =
        last_attempt_succeeded || (policy.perform_all_attempts && last_success_data.is_some());
    if succeeded {
        if let Some(trial) = &policy.trial {
            if trial.log_final_response {
                tracing::info!(success = true, "trial-mode final response");
            }
        }
        return Ok(if policy.res_req {
            CallOutcome::Body(last_success_data.unwrap_or(Value::Null))
        } else {
            CallOutcome::Completed
        });
    }

    let error = RequestError::Exhausted { attempts: policy.attempts, failures };
    finish_failure(policy, &spec.request, error, trial_mode)
}

fn simulate_attempt(
    trial: &TrialConfig,
    attempt: u32,
    rng: &mut Option<StdRng>,
) -> Result<Value, AttemptError> {
    let failure_probability = if attempt == 1 {
        trial.req_failure_probability
    } else {
        trial.retry_failure_probability
    };
    let failed = draw(failure_probability, rng);
    if failed {
        let retryable = draw(trial.retry_failure_probability, rng);
        Err(AttemptError::Trial { retryable })
    } else {
        Ok(json!({ "trial": true, "attempt": attempt }))
    }
}

fn draw(probability: f64, rng: &mut Option<StdRng>) -> bool {
    match rng {
        Some(rng) => rng.random_bool(probability),
        None => rand::rng().random_bool(probability),
    }
}

fn analyze(
    policy: &RequestPolicy,
    request: &Request,
    data: &Value,
    trial_mode: bool,
) -> Result<(), AttemptError> {
    let Some(analyzer) = &policy.response_analyzer else {
        return Ok(());
    };
    match analyzer(request, data, trial_mode) {
        Ok(true) => Ok(()),
        Ok(false) => Err(AttemptError::InvalidContent {
            status: 200,
            reason: "response analyzer returned false".into(),
        }),
        Err(error) => Err(AttemptError::AnalyzerFailed { reason: error.to_string() }),
    }
}

fn finish_failure(
    policy: &RequestPolicy,
    request: &Request,
    error: RequestError,
    trial_mode: bool,
) -> Result<CallOutcome, RequestError> {
    if let Some(trial) = &policy.trial {
        if trial.log_final_response {
            tracing::info!(success = false, %error, "trial-mode final response");
        }
    }
    if let Some(analyzer) = &policy.final_error_analyzer {
        match analyzer(request, &error, trial_mode) {
            Ok(true) => {
                tracing::debug!(%error, "final error suppressed by analyzer");
                return Ok(CallOutcome::Suppressed);
            }
            Ok(false) => {}
            Err(hook_error) => {
                tracing::warn!(error = %hook_error, "final error analyzer failed; surfacing original error");
            }
        }
    }
    Err(error)
}

fn push_bounded(failures: &mut Vec<AttemptError>, failure: AttemptError) {
    failures.push(failure);
    if failures.len() > MAX_ATTEMPT_FAILURES {
        let excess = failures.len() - MAX_ATTEMPT_FAILURES;
        failures.drain(0..excess);
    }
}

/// Invoke a user hook, logging instead of propagating its failure.
fn run_hook(name: &str, hook: impl FnOnce() -> Result<(), BoxError>) {
    if let Err(error) = hook() {
        tracing::warn!(hook = name, %error, "user hook failed; continuing");
    }
}

/// Serialize a value to JSON and truncate to `max` characters.
pub(crate) fn serialize_truncated<T: Serialize>(value: &T, max: usize) -> String {
    let serialized = serde_json::to_string(value).unwrap_or_else(|_| "<unserializable>".into());
    if serialized.chars().count() <= max {
        serialized
    } else {
        serialized.chars().take(max).collect()
    }
}
