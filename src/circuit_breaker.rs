//! Failure-rate circuit breaker with half-open probing.
//!
//! The breaker trips when, over at least `minimum_requests` observations,
//! the failure percentage reaches `failure_threshold_pct`. After
//! `recovery_timeout` it admits up to `half_open_max_requests` probe
//! requests; their success percentage against `success_threshold_pct`
//! decides between closing and re-opening.
//!
//! Counters mutate only through the `record_*` methods and `reset`; state
//! transitions happen only inside private helpers. Trip decisions read
//! several counters together, so the core lives behind a mutex rather than
//! individual atomics.

use crate::error::RequestError;
use crate::time::{Clock, MonotonicClock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Bound on stored state transitions.
const MAX_TRANSITION_HISTORY: usize = 32;

/// Closed-state counters are zeroed (state preserved) once total observations
/// reach `minimum_requests * RESET_MULTIPLIER`, bounding unbounded growth.
const RESET_MULTIPLIER: u64 = 10;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerConfigError {
    #[error("failure_threshold_pct must be within [0, 100] (got {0})")]
    InvalidFailureThreshold(f64),
    #[error("success_threshold_pct must be within [0, 100] (got {0})")]
    InvalidSuccessThreshold(f64),
    #[error("minimum_requests must be >= 1 (got {0})")]
    InvalidMinimumRequests(u64),
    #[error("recovery_timeout must be >= 100ms (got {0:?})")]
    RecoveryTimeoutTooShort(Duration),
    #[error("half_open_max_requests must be >= 1 (got {0})")]
    InvalidHalfOpenMax(u64),
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage that trips the breaker, within [0, 100].
    pub failure_threshold_pct: f64,
    /// Observations required before the threshold is consulted.
    pub minimum_requests: u64,
    /// Time the breaker stays open before probing.
    pub recovery_timeout: Duration,
    /// Probe success percentage required to close again.
    pub success_threshold_pct: f64,
    /// Maximum concurrent/total probes admitted while half-open.
    pub half_open_max_requests: u64,
    /// Feed every engine attempt into the counters instead of only the
    /// outer per-item result.
    pub track_individual_attempts: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_pct: 50.0,
            minimum_requests: 10,
            recovery_timeout: Duration::from_secs(30),
            success_threshold_pct: 50.0,
            half_open_max_requests: 5,
            track_individual_attempts: false,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), CircuitBreakerConfigError> {
        if !(0.0..=100.0).contains(&self.failure_threshold_pct) {
            return Err(CircuitBreakerConfigError::InvalidFailureThreshold(
                self.failure_threshold_pct,
            ));
        }
        if !(0.0..=100.0).contains(&self.success_threshold_pct) {
            return Err(CircuitBreakerConfigError::InvalidSuccessThreshold(
                self.success_threshold_pct,
            ));
        }
        if self.minimum_requests == 0 {
            return Err(CircuitBreakerConfigError::InvalidMinimumRequests(self.minimum_requests));
        }
        if self.recovery_timeout < Duration::from_millis(100) {
            return Err(CircuitBreakerConfigError::RecoveryTimeoutTooShort(self.recovery_timeout));
        }
        if self.half_open_max_requests == 0 {
            return Err(CircuitBreakerConfigError::InvalidHalfOpenMax(self.half_open_max_requests));
        }
        Ok(())
    }
}

/// Counter block, exposed read-only and in snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerCounters {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub successful_requests: u64,
    pub half_open_requests: u64,
    pub half_open_successes: u64,
    pub half_open_failures: u64,
    pub last_failure_time: Option<u64>,
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_millis: u64,
}

/// Persisted breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub counters: BreakerCounters,
    pub transitions: Vec<StateTransition>,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    counters: BreakerCounters,
    transitions: Vec<StateTransition>,
}

/// Failure-rate circuit breaker. Cloning shares state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    core: Arc<Mutex<BreakerCore>>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerConfigError> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                counters: BreakerCounters::default(),
                transitions: Vec::new(),
            })),
            config: Arc::new(config),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn counters(&self) -> BreakerCounters {
        self.lock().counters.clone()
    }

    /// Whether a request may be dispatched right now.
    ///
    /// Closed: always true. Open: false until the recovery timeout elapses,
    /// at which point the breaker moves to half-open. Half-open: true while
    /// probe slots remain; a true return reserves one probe slot and must be
    /// followed by exactly one `record_*` call.
    pub fn can_execute(&self) -> bool {
        let mut core = self.lock();
        match core.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let now = self.clock.now_millis();
                let since = core.counters.last_failure_time.map(|t| now.saturating_sub(t));
                if since.map(|s| s >= self.config.recovery_timeout.as_millis() as u64)
                    == Some(true)
                {
                    self.transition(&mut core, CircuitState::HalfOpen);
                    core.counters.half_open_requests = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if core.counters.half_open_requests < self.config.half_open_max_requests {
                    core.counters.half_open_requests += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Gate, run, record.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, RequestError>
    where
        T: Send,
        Fut: Future<Output = Result<T, RequestError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        if !self.can_execute() {
            return Err(self.rejection());
        }
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// The error a gated-out request receives.
    pub fn rejection(&self) -> RequestError {
        let core = self.lock();
        RequestError::CircuitOpen {
            failed: core.counters.failed_requests,
            total: core.counters.total_requests,
        }
    }

    pub fn record_success(&self) {
        let mut core = self.lock();
        self.record(&mut core, true);
    }

    pub fn record_failure(&self) {
        let mut core = self.lock();
        self.record(&mut core, false);
    }

    /// Per-attempt feed used when `track_individual_attempts` is set.
    pub fn record_attempt_success(&self) {
        self.record_success();
    }

    /// Per-attempt feed used when `track_individual_attempts` is set.
    pub fn record_attempt_failure(&self) {
        self.record_failure();
    }

    /// Zero all counters and close the breaker.
    pub fn reset(&self) {
        let mut core = self.lock();
        if core.state != CircuitState::Closed {
            self.transition(&mut core, CircuitState::Closed);
        }
        core.counters = BreakerCounters::default();
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let core = self.lock();
        CircuitBreakerSnapshot {
            state: core.state,
            counters: core.counters.clone(),
            transitions: core.transitions.clone(),
        }
    }

    pub fn restore(&self, snapshot: CircuitBreakerSnapshot) {
        let mut core = self.lock();
        core.state = snapshot.state;
        core.counters = snapshot.counters;
        core.transitions = snapshot.transitions;
        core.transitions.truncate(MAX_TRANSITION_HISTORY);
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.lock().transitions.clone()
    }

    fn record(&self, core: &mut BreakerCore, success: bool) {
        core.counters.total_requests += 1;
        if success {
            core.counters.successful_requests += 1;
        } else {
            core.counters.failed_requests += 1;
            core.counters.last_failure_time = Some(self.clock.now_millis());
        }

        match core.state {
            CircuitState::Closed => {
                let total = core.counters.total_requests;
                let failed = core.counters.failed_requests;
                if total >= self.config.minimum_requests {
                    let rate = failed as f64 / total as f64 * 100.0;
                    if rate >= self.config.failure_threshold_pct {
                        tracing::error!(
                            failed,
                            total,
                            threshold = self.config.failure_threshold_pct,
                            "circuit breaker opened"
                        );
                        self.transition(core, CircuitState::Open);
                        return;
                    }
                }
                // Bound counter growth without losing state.
                if total >= self.config.minimum_requests * RESET_MULTIPLIER {
                    let last_failure = core.counters.last_failure_time;
                    core.counters = BreakerCounters::default();
                    core.counters.last_failure_time = last_failure;
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    core.counters.half_open_successes += 1;
                } else {
                    core.counters.half_open_failures += 1;
                }
                let completed =
                    core.counters.half_open_successes + core.counters.half_open_failures;
                if completed >= self.config.half_open_max_requests {
                    let rate = core.counters.half_open_successes as f64 / completed as f64 * 100.0;
                    if rate >= self.config.success_threshold_pct {
                        tracing::info!(rate, "circuit breaker closed after probing");
                        self.transition(core, CircuitState::Closed);
                        core.counters = BreakerCounters::default();
                    } else {
                        tracing::warn!(rate, "circuit breaker re-opened after probing");
                        core.counters.last_failure_time = Some(self.clock.now_millis());
                        self.transition(core, CircuitState::Open);
                    }
                }
            }
            CircuitState::Open => {
                // Late completion from a request admitted before the trip;
                // counters were already updated above, nothing else to do.
            }
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: CircuitState) {
        let from = core.state;
        core.state = to;
        core.counters.half_open_requests = 0;
        core.counters.half_open_successes = 0;
        core.counters.half_open_failures = 0;
        core.transitions.push(StateTransition { from, to, at_millis: self.clock.now_millis() });
        if core.transitions.len() > MAX_TRANSITION_HISTORY {
            let excess = core.transitions.len() - MAX_TRANSITION_HISTORY;
            core.transitions.drain(0..excess);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn breaker(min: u64, threshold: f64, recovery_ms: u64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold_pct: threshold,
            minimum_requests: min,
            recovery_timeout: Duration::from_millis(recovery_ms),
            ..CircuitBreakerConfig::default()
        })
        .unwrap()
        .with_clock(clock.clone());
        (breaker, clock)
    }

    #[test]
    fn rejects_invalid_config() {
        let config = CircuitBreakerConfig {
            failure_threshold_pct: 120.0,
            ..CircuitBreakerConfig::default()
        };
        assert!(matches!(
            CircuitBreaker::new(config).unwrap_err(),
            CircuitBreakerConfigError::InvalidFailureThreshold(_)
        ));

        let config =
            CircuitBreakerConfig { minimum_requests: 0, ..CircuitBreakerConfig::default() };
        assert!(CircuitBreaker::new(config).is_err());

        let config = CircuitBreakerConfig {
            recovery_timeout: Duration::from_millis(50),
            ..CircuitBreakerConfig::default()
        };
        assert!(matches!(
            CircuitBreaker::new(config).unwrap_err(),
            CircuitBreakerConfigError::RecoveryTimeoutTooShort(_)
        ));
    }

    #[test]
    fn stays_closed_below_minimum_requests() {
        let (breaker, _clock) = breaker(5, 50.0, 1000);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn opens_at_failure_threshold() {
        let (breaker, _clock) = breaker(2, 50.0, 1000);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn failure_rate_below_threshold_keeps_closed() {
        let (breaker, _clock) = breaker(4, 75.0, 1000);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        // 2 of 4 failed = 50% < 75%
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let (breaker, clock) = breaker(2, 50.0, 1000);
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.can_execute());

        clock.advance(999);
        assert!(!breaker.can_execute());

        clock.advance(1);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_caps_probes() {
        let (breaker, clock) = breaker(2, 50.0, 1000);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(1000);

        // Default cap is 5 probes.
        for _ in 0..5 {
            assert!(breaker.can_execute());
        }
        assert!(!breaker.can_execute());
    }

    #[test]
    fn closes_when_probe_success_rate_meets_threshold() {
        let (breaker, clock) = breaker(2, 50.0, 1000);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(1000);

        for _ in 0..5 {
            assert!(breaker.can_execute());
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counters(), BreakerCounters::default());
    }

    #[test]
    fn reopens_when_probe_success_rate_is_low() {
        let (breaker, clock) = breaker(2, 50.0, 1000);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(1000);

        for i in 0..5 {
            assert!(breaker.can_execute());
            if i == 0 {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        // 1 of 5 = 20% < 50%
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn closed_counters_reset_at_multiplier_without_state_change() {
        let (breaker, _clock) = breaker(2, 95.0, 1000);
        // 19 successes + the 20th observation hits 2 * 10.
        for _ in 0..20 {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counters().total_requests, 0);
    }

    #[tokio::test]
    async fn execute_gates_and_records() {
        let (breaker, _clock) = breaker(2, 50.0, 1000);

        let ok: Result<u32, RequestError> = breaker.execute(|| async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);
        assert_eq!(breaker.counters().successful_requests, 1);

        for _ in 0..2 {
            let _: Result<u32, RequestError> =
                breaker.execute(|| async { Err(RequestError::Cancelled) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected: Result<u32, RequestError> = breaker.execute(|| async { Ok(1) }).await;
        assert!(rejected.unwrap_err().is_circuit_open());
    }

    #[test]
    fn snapshot_round_trips() {
        let (breaker, clock) = breaker(2, 50.0, 1000);
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(5);

        let snapshot = breaker.snapshot();
        let (fresh, _clock) = self::breaker(2, 50.0, 1000);
        fresh.restore(snapshot.clone());
        assert_eq!(fresh.snapshot(), snapshot);
        assert_eq!(fresh.state(), CircuitState::Open);
    }

    #[test]
    fn reset_closes_and_zeroes() {
        let (breaker, _clock) = breaker(2, 50.0, 1000);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counters(), BreakerCounters::default());
        assert!(breaker.can_execute());
    }

    #[test]
    fn transition_history_is_recorded_and_bounded() {
        let (breaker, clock) = breaker(1, 100.0, 1000);
        for _ in 0..40 {
            breaker.record_failure(); // closed -> open
            clock.advance(1000);
            assert!(breaker.can_execute()); // open -> half-open
            breaker.record_failure();
            for _ in 0..4 {
                assert!(breaker.can_execute());
                breaker.record_failure();
            }
            // probes failed -> open again; reset to run another cycle
            breaker.reset();
        }
        let transitions = breaker.transitions();
        assert!(transitions.len() <= 32);
        assert!(transitions.iter().any(|t| t.to == CircuitState::HalfOpen));
    }
}
