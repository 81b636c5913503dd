//! Concurrency limiter: a FIFO semaphore with occupancy accounting.
//!
//! Unlike a rejecting bulkhead, `acquire` parks the caller until a permit
//! frees up. Permits hand off directly to the longest-waiting caller on
//! release; there is no decrement-then-reacquire window where an unrelated
//! task could jump the queue.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyConfigError {
    #[error("limit must be >= 1")]
    ZeroLimit,
}

/// Runtime errors surfaced to waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("concurrency limiter was shut down while waiting")]
    ShutDown,
}

#[derive(Debug, Default)]
struct LimiterStats {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    queued: AtomicUsize,
    peak_queued: AtomicUsize,
    total_acquired: AtomicU64,
}

/// Persisted limiter state: counters and peaks. Occupancy is transient and
/// not restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLimiterSnapshot {
    pub limit: usize,
    pub total_acquired: u64,
    pub peak_running: usize,
    pub peak_queued: usize,
}

/// An acquired slot. Dropping it releases the slot on every path.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<LimiterStats>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.stats.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO semaphore. Cloning shares state.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    stats: Arc<LimiterStats>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Result<Self, ConcurrencyConfigError> {
        if limit == 0 {
            return Err(ConcurrencyConfigError::ZeroLimit);
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            stats: Arc::new(LimiterStats::default()),
            limit,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Currently running operations.
    pub fn running(&self) -> usize {
        self.stats.running.load(Ordering::SeqCst)
    }

    /// Currently parked acquirers.
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
    }

    /// Wait for a slot, FIFO by enqueue order.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, ConcurrencyError> {
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        bump_peak(&self.stats.peak_queued, self.stats.queued.load(Ordering::SeqCst));

        let acquired = self.semaphore.clone().acquire_owned().await;
        self.stats.queued.fetch_sub(1, Ordering::SeqCst);
        let permit = acquired.map_err(|_| ConcurrencyError::ShutDown)?;

        let running = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        bump_peak(&self.stats.peak_running, running);
        self.stats.total_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrencyPermit { _permit: permit, stats: self.stats.clone() })
    }

    /// Acquire, run, release. The slot is released on success and failure
    /// alike.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ConcurrencyError>
    where
        Fut: Future<Output = T>,
        Op: FnOnce() -> Fut,
    {
        let _permit = self.acquire().await?;
        Ok(operation().await)
    }

    /// Fail every parked waiter and refuse future acquisitions.
    pub fn shutdown(&self) {
        self.semaphore.close();
    }

    pub fn snapshot(&self) -> ConcurrencyLimiterSnapshot {
        ConcurrencyLimiterSnapshot {
            limit: self.limit,
            total_acquired: self.stats.total_acquired.load(Ordering::SeqCst),
            peak_running: self.stats.peak_running.load(Ordering::SeqCst),
            peak_queued: self.stats.peak_queued.load(Ordering::SeqCst),
        }
    }

    pub fn restore(&self, snapshot: ConcurrencyLimiterSnapshot) {
        self.stats.total_acquired.store(snapshot.total_acquired, Ordering::SeqCst);
        self.stats.peak_running.store(snapshot.peak_running, Ordering::SeqCst);
        self.stats.peak_queued.store(snapshot.peak_queued, Ordering::SeqCst);
    }
}

fn bump_peak(peak: &AtomicUsize, observed: usize) {
    peak.fetch_max(observed, Ordering::SeqCst);
}
