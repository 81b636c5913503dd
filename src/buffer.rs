//! Serialized transactional key/value state.
//!
//! A [`StableBuffer`] holds a JSON object mutated only through [`run`],
//! which admits one transaction at a time (FIFO by arrival). Each
//! transaction works on a mutable snapshot; the snapshot replaces the live
//! state only when the closure finishes inside the timeout, so a timed-out
//! transaction leaves no partial writes.
//!
//! [`run`]: StableBuffer::run

use crate::time::{Clock, SystemClock};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bound on retained transaction log entries.
const MAX_LOG_ENTRIES: usize = 256;

/// Buffer state: a JSON object addressed by string keys.
pub type BufferState = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Budget for a single transaction closure.
    pub transaction_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { transaction_timeout: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer transaction {id} timed out after {elapsed_ms}ms")]
    TransactionTimeout { id: u64, elapsed_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransactionStatus {
    Committed,
    TimedOut,
}

/// One transaction log entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub started_at: u64,
    pub ended_at: u64,
    pub status: TransactionStatus,
    /// Time spent waiting for earlier transactions.
    pub wait_ms: u64,
}

struct BufferInner {
    state: tokio::sync::Mutex<BufferState>,
    log: std::sync::Mutex<Vec<TransactionRecord>>,
    next_id: AtomicU64,
    config: BufferConfig,
    clock: Arc<dyn Clock>,
}

/// Serialized transactional store. Cloning shares state.
#[derive(Clone)]
pub struct StableBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for StableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableBuffer").field("config", &self.inner.config).finish()
    }
}

impl Default for StableBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}

impl StableBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: tokio::sync::Mutex::new(BufferState::new()),
                log: std::sync::Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                config,
                clock: Arc::new(SystemClock),
            }),
        }
    }

    /// Execute one transaction.
    ///
    /// The closure receives a mutable snapshot of the state; the snapshot
    /// commits only if the closure resolves within the configured timeout.
    /// Transactions are admitted strictly one at a time, FIFO.
    pub async fn run<T>(
        &self,
        transaction: impl for<'a> FnOnce(&'a mut BufferState) -> BoxFuture<'a, T> + Send,
    ) -> Result<T, BufferError>
    where
        T: Send,
    {
        let arrived_at = self.inner.clock.now_millis();
        let mut guard = self.inner.state.lock().await;
        let started_at = self.inner.clock.now_millis();
        let wait_ms = started_at.saturating_sub(arrived_at);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let mut working = guard.clone();
        let outcome =
            tokio::time::timeout(self.inner.config.transaction_timeout, transaction(&mut working))
                .await;
        let ended_at = self.inner.clock.now_millis();

        match outcome {
            Ok(value) => {
                *guard = working;
                self.record(TransactionRecord {
                    id,
                    started_at,
                    ended_at,
                    status: TransactionStatus::Committed,
                    wait_ms,
                });
                Ok(value)
            }
            Err(_) => {
                let elapsed_ms = ended_at.saturating_sub(started_at);
                tracing::warn!(id, elapsed_ms, "buffer transaction timed out; discarding writes");
                self.record(TransactionRecord {
                    id,
                    started_at,
                    ended_at,
                    status: TransactionStatus::TimedOut,
                    wait_ms,
                });
                Err(BufferError::TransactionTimeout { id, elapsed_ms })
            }
        }
    }

    /// Immutable snapshot of the current state.
    pub async fn read(&self) -> BufferState {
        self.inner.state.lock().await.clone()
    }

    /// Convenience getter for a single key.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().await.get(key).cloned()
    }

    pub fn transaction_log(&self) -> Vec<TransactionRecord> {
        self.inner.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn record(&self, record: TransactionRecord) {
        let mut log = self.inner.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        log.push(record);
        if log.len() > MAX_LOG_ENTRIES {
            let excess = log.len() - MAX_LOG_ENTRIES;
            log.drain(0..excess);
        }
    }
}
