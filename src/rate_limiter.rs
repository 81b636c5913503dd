//! Token-bucket rate limiter with a FIFO wait queue.
//!
//! Tokens refill in whole-window increments: after `windows_passed` full
//! windows, `windows_passed * max_requests` tokens are added (capped at the
//! bucket size). `acquire` consumes a token when one is available and
//! otherwise parks the caller in a FIFO queue drained at the next refill.
//! The refill timer is the only long-lived task and is cleared on
//! [`RateLimiter::shutdown`].

use crate::time::{Clock, MonotonicClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("max_requests must be >= 1")]
    ZeroMaxRequests,
    #[error("window must be > 0")]
    ZeroWindow,
}

/// Runtime errors surfaced to waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter was shut down while waiting")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Tokens per window; also the bucket capacity.
    pub max_requests: u64,
    /// Refill window.
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window: Duration) -> Result<Self, RateLimitConfigError> {
        if max_requests == 0 {
            return Err(RateLimitConfigError::ZeroMaxRequests);
        }
        if window.is_zero() {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        Ok(Self { max_requests, window })
    }
}

/// Queue and throughput statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterMetrics {
    pub peak_queue_len: u64,
    pub total_queue_wait_ms: u64,
    /// Highest number of admissions observed within one window.
    pub peak_window_rate: u64,
    pub current_window_count: u64,
    pub window_start: u64,
}

/// Persisted limiter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub tokens: u64,
    pub last_refill: u64,
    pub metrics: RateLimiterMetrics,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    enqueued_at: u64,
}

struct LimiterCore {
    tokens: u64,
    last_refill: u64,
    queue: VecDeque<Waiter>,
    timer: Option<tokio::task::JoinHandle<()>>,
    metrics: RateLimiterMetrics,
    shutdown: bool,
}

/// Token-bucket limiter. Cloning shares state.
#[derive(Clone)]
pub struct RateLimiter {
    core: Arc<Mutex<LimiterCore>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Self {
            core: Arc::new(Mutex::new(LimiterCore {
                tokens: config.max_requests,
                last_refill: now,
                queue: VecDeque::new(),
                timer: None,
                metrics: RateLimiterMetrics { window_start: now, ..Default::default() },
                shutdown: false,
            })),
            config,
            clock,
        }
    }

    /// Override the clock (deterministic tests). Refill *timers* still run on
    /// tokio time; only token arithmetic uses the clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Consume one token, parking FIFO until the next refill if none are
    /// available.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let rx = {
            let mut core = self.lock();
            if core.shutdown {
                return Err(RateLimitError::ShutDown);
            }
            let now = self.clock.now_millis();
            self.refill(&mut core, now);
            if core.tokens > 0 {
                core.tokens -= 1;
                self.note_admission(&mut core, now);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            core.queue.push_back(Waiter { tx, enqueued_at: now });
            let depth = core.queue.len() as u64;
            core.metrics.peak_queue_len = core.metrics.peak_queue_len.max(depth);
            tracing::debug!(depth, "rate limiter queueing request");
            self.ensure_timer(&mut core, now);
            rx
        };
        rx.await.map_err(|_| RateLimitError::ShutDown)
    }

    /// Acquire, then run the operation. The token is not returned; the
    /// bucket refills on window boundaries only.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, RateLimitError>
    where
        Fut: Future<Output = T>,
        Op: FnOnce() -> Fut,
    {
        self.acquire().await?;
        Ok(operation().await)
    }

    /// Tokens currently available (after an on-demand refill).
    pub fn available_tokens(&self) -> u64 {
        let mut core = self.lock();
        let now = self.clock.now_millis();
        self.refill(&mut core, now);
        core.tokens
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        self.lock().metrics.clone()
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let core = self.lock();
        RateLimiterSnapshot {
            tokens: core.tokens,
            last_refill: core.last_refill,
            metrics: core.metrics.clone(),
        }
    }

    pub fn restore(&self, snapshot: RateLimiterSnapshot) {
        let mut core = self.lock();
        core.tokens = snapshot.tokens.min(self.config.max_requests);
        core.last_refill = snapshot.last_refill;
        core.metrics = snapshot.metrics;
    }

    /// Cancel the refill timer and fail all parked waiters.
    pub fn shutdown(&self) {
        let mut core = self.lock();
        core.shutdown = true;
        if let Some(timer) = core.timer.take() {
            timer.abort();
        }
        core.queue.clear();
    }

    fn refill(&self, core: &mut LimiterCore, now: u64) {
        let window_ms = self.config.window.as_millis() as u64;
        let elapsed = now.saturating_sub(core.last_refill);
        let windows_passed = elapsed / window_ms;
        if windows_passed == 0 {
            return;
        }
        core.tokens = (core.tokens + windows_passed * self.config.max_requests)
            .min(self.config.max_requests);
        core.last_refill += windows_passed * window_ms;
    }

    fn process_queue(&self, core: &mut LimiterCore, now: u64) {
        while core.tokens > 0 {
            let Some(waiter) = core.queue.pop_front() else { break };
            core.tokens -= 1;
            core.metrics.total_queue_wait_ms += now.saturating_sub(waiter.enqueued_at);
            self.note_admission(core, now);
            // A dropped receiver just wastes the token; the refill window
            // returns it.
            let _ = waiter.tx.send(());
        }
    }

    fn note_admission(&self, core: &mut LimiterCore, now: u64) {
        let window_ms = self.config.window.as_millis() as u64;
        if now.saturating_sub(core.metrics.window_start) >= window_ms {
            core.metrics.window_start = now;
            core.metrics.current_window_count = 0;
        }
        core.metrics.current_window_count += 1;
        core.metrics.peak_window_rate =
            core.metrics.peak_window_rate.max(core.metrics.current_window_count);
    }

    fn ensure_timer(&self, core: &mut LimiterCore, now: u64) {
        if core.timer.is_some() {
            return;
        }
        let window_ms = self.config.window.as_millis() as u64;
        let delay = window_ms.saturating_sub(now.saturating_sub(core.last_refill)).max(1);
        let limiter = self.clone();
        core.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            limiter.on_refill_timer();
        }));
    }

    fn on_refill_timer(&self) {
        let mut core = self.lock();
        core.timer = None;
        if core.shutdown {
            return;
        }
        let now = self.clock.now_millis();
        self.refill(&mut core, now);
        self.process_queue(&mut core, now);
        if !core.queue.is_empty() {
            self.ensure_timer(&mut core, now);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
