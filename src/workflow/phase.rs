//! Phase execution: one gateway batch with phase-level shaping.
//!
//! A phase layers its own policy defaults, concurrency/rate/breaker
//! overrides and an optional deadline over the ambient gateway options,
//! runs the batch, derives metrics, checks guardrails, persists
//! infrastructure state when asked, and runs the completion hook inside a
//! buffer transaction.

use crate::buffer::BufferState;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::concurrency::ConcurrencyLimiter;
use crate::gateway::{
    stable_api_gateway, GatewayItem, GatewayOptions, GatewayResponse, PolicyOverrides,
    RequestGroup,
};
use crate::metrics::{BatchMetrics, GuardrailViolation, MetricsGuardrails};
use crate::persistence::{InfraSnapshot, PersistenceCoordinator};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::time::{Clock, SystemClock};
use crate::transport::HttpTransport;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Completion hook: observes the result and mutates shared buffer state
/// inside one transaction.
pub type PhaseCompletionHook = Arc<
    dyn for<'a> Fn(&'a PhaseResult, &'a mut BufferState) -> BoxFuture<'a, ()> + Send + Sync,
>;

/// Declarative phase: a batch plus shaping.
#[derive(Clone, Default)]
pub struct Phase {
    pub id: Option<String>,
    pub items: Vec<GatewayItem>,
    pub concurrent_execution: Option<bool>,
    pub stop_on_first_error: Option<bool>,
    /// Policy defaults layered over the ambient gateway commons.
    pub common_policy: Option<PolicyOverrides>,
    pub request_groups: Vec<RequestGroup>,
    /// Replaces the ambient concurrency limiter for this phase.
    pub max_concurrent_requests: Option<usize>,
    /// Replaces the ambient rate limiter for this phase.
    pub rate_limit: Option<RateLimitConfig>,
    /// Replaces the ambient circuit breaker for this phase.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Deadline for the whole batch.
    pub max_timeout: Option<Duration>,
    /// Snapshot infrastructure state after the phase completes.
    pub state_persistence: bool,
    pub guardrails: Option<MetricsGuardrails>,
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("items", &self.items.len())
            .field("max_timeout", &self.max_timeout)
            .finish()
    }
}

/// Ambient context phases execute in.
#[derive(Clone)]
pub struct PhaseContext {
    pub transport: Arc<dyn HttpTransport>,
    pub options: GatewayOptions,
    pub persistence: Option<PersistenceCoordinator>,
    pub on_phase_completion: Option<PhaseCompletionHook>,
}

impl PhaseContext {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            options: GatewayOptions::default(),
            persistence: None,
            on_phase_completion: None,
        }
    }

    pub fn with_options(mut self, options: GatewayOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceCoordinator) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_completion_hook(mut self, hook: PhaseCompletionHook) -> Self {
        self.on_phase_completion = Some(hook);
        self
    }
}

/// Failures owned by the phase itself (as opposed to per-item failures,
/// which live in the responses).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PhaseError {
    #[error("phase timed out after {limit:?}")]
    Timeout { limit: Duration },
    #[error("invalid phase configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub phase_id: Option<String>,
    pub started_at: u64,
    pub ended_at: u64,
    pub success_count: usize,
    pub failure_count: usize,
    pub responses: Vec<GatewayResponse>,
    pub metrics: BatchMetrics,
    pub guardrail_violations: Vec<GuardrailViolation>,
    pub error: Option<PhaseError>,
}

impl PhaseResult {
    /// A phase succeeds when it completed and every item succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.failure_count == 0
    }

    fn empty(phase: &Phase, started_at: u64, ended_at: u64, error: PhaseError) -> Self {
        Self {
            phase_id: phase.id.clone(),
            started_at,
            ended_at,
            success_count: 0,
            failure_count: 0,
            responses: Vec::new(),
            metrics: BatchMetrics::default(),
            guardrail_violations: Vec::new(),
            error: Some(error),
        }
    }
}

/// Execute one phase.
pub async fn execute_phase(phase: &Phase, ctx: &PhaseContext) -> PhaseResult {
    let clock = SystemClock;
    let started_at = clock.now_millis();

    let options = match phase_options(phase, ctx) {
        Ok(options) => options,
        Err(error) => {
            tracing::error!(phase = ?phase.id, %error, "phase configuration rejected");
            return PhaseResult::empty(phase, started_at, clock.now_millis(), error);
        }
    };

    let batch = stable_api_gateway(ctx.transport.as_ref(), phase.items.clone(), &options);
    let responses = match phase.max_timeout {
        Some(limit) => match tokio::time::timeout(limit, batch).await {
            Ok(responses) => responses,
            Err(_) => {
                tracing::warn!(phase = ?phase.id, ?limit, "phase timed out");
                let result = PhaseResult::empty(
                    phase,
                    started_at,
                    clock.now_millis(),
                    PhaseError::Timeout { limit },
                );
                complete_phase(&result, phase, ctx, &options).await;
                return result;
            }
        },
        None => batch.await,
    };

    let metrics = BatchMetrics::from_responses(&responses);
    let guardrail_violations = match &phase.guardrails {
        Some(guardrails) => {
            let violations = guardrails.check(&metrics);
            for violation in &violations {
                tracing::warn!(phase = ?phase.id, %violation, "phase guardrail violated");
            }
            violations
        }
        None => Vec::new(),
    };

    let result = PhaseResult {
        phase_id: phase.id.clone(),
        started_at,
        ended_at: clock.now_millis(),
        success_count: metrics.successes,
        failure_count: metrics.failures,
        responses,
        metrics,
        guardrail_violations,
        error: None,
    };
    complete_phase(&result, phase, ctx, &options).await;
    result
}

/// Merge ambient options with phase-level shaping.
fn phase_options(phase: &Phase, ctx: &PhaseContext) -> Result<GatewayOptions, PhaseError> {
    let mut options = ctx.options.clone();
    if let Some(common) = &phase.common_policy {
        options.common_policy = common.merged_over(&options.common_policy);
    }
    if !phase.request_groups.is_empty() {
        options.request_groups = phase.request_groups.clone();
    }
    options.concurrent_execution = Some(phase.concurrent_execution.unwrap_or(true));
    options.stop_on_first_error = phase.stop_on_first_error.unwrap_or(false);

    if let Some(limit) = phase.max_concurrent_requests {
        options.concurrency_limiter = Some(
            ConcurrencyLimiter::new(limit).map_err(|e| PhaseError::InvalidConfig(e.to_string()))?,
        );
    }
    if let Some(config) = phase.rate_limit {
        options.rate_limiter = Some(RateLimiter::new(config));
    }
    if let Some(config) = &phase.circuit_breaker {
        options.circuit_breaker = Some(
            CircuitBreaker::new(config.clone())
                .map_err(|e| PhaseError::InvalidConfig(e.to_string()))?,
        );
    }
    Ok(options)
}

/// Post-batch duties: state persistence and the completion hook.
async fn complete_phase(
    result: &PhaseResult,
    phase: &Phase,
    ctx: &PhaseContext,
    options: &GatewayOptions,
) {
    if phase.state_persistence {
        if let Some(persistence) = &ctx.persistence {
            let snapshot = InfraSnapshot {
                circuit_breaker: options.circuit_breaker.as_ref().map(|b| b.snapshot()),
                rate_limiter: options.rate_limiter.as_ref().map(|l| l.snapshot()),
                concurrency_limiter: options.concurrency_limiter.as_ref().map(|l| l.snapshot()),
                cache: options.cache.as_ref().map(|c| c.snapshot()),
                function_cache: options.function_cache.as_ref().map(|c| c.snapshot()),
            };
            persistence.store(persistence.next_op_id(), snapshot).await;
        } else {
            tracing::debug!(phase = ?phase.id, "state_persistence set but no coordinator wired");
        }
    }

    if let Some(hook) = &ctx.on_phase_completion {
        match &ctx.options.shared_buffer {
            Some(buffer) => {
                let hook = hook.clone();
                let result = result.clone();
                let outcome = buffer
                    .run(move |state| {
                        Box::pin(async move {
                            hook(&result, state).await;
                        })
                    })
                    .await;
                if let Err(error) = outcome {
                    tracing::warn!(%error, "phase completion hook transaction failed");
                }
            }
            None => {
                tracing::debug!(phase = ?phase.id, "completion hook set but no shared buffer");
            }
        }
    }
}
