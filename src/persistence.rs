//! Snapshot and restore of infrastructure component state.
//!
//! Each infrastructure component exposes `snapshot()`/`restore()`; this
//! module gathers those into one [`InfraSnapshot`] record, stages it through
//! the shared [`StableBuffer`] and optionally mirrors it to a caller-supplied
//! [`PersistenceBackend`]. Stores are best-effort: backend failures are
//! logged, never surfaced. Operation ids are monotonic and replays of
//! already-processed ids are skipped, so a backend may deliver duplicates.

use crate::buffer::StableBuffer;
use crate::cache::{CacheSnapshot, CachedResponse};
use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::concurrency::ConcurrencyLimiterSnapshot;
use crate::error::BoxError;
use crate::rate_limiter::RateLimiterSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Buffer key under which infrastructure state is staged.
const INFRA_STATE_KEY: &str = "__infra_state__";

/// Pluggable durable storage for infrastructure snapshots.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Latest stored document, if any.
    async fn load(&self) -> Result<Option<Value>, BoxError>;
    /// Store a document. May be called with duplicate operation ids.
    async fn store(&self, document: &Value) -> Result<(), BoxError>;
}

/// Combined persisted state of all infrastructure components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraSnapshot {
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    pub rate_limiter: Option<RateLimiterSnapshot>,
    pub concurrency_limiter: Option<ConcurrencyLimiterSnapshot>,
    pub cache: Option<CacheSnapshot<CachedResponse>>,
    pub function_cache: Option<CacheSnapshot<Value>>,
}

/// Envelope stored in the buffer and the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub op_id: u64,
    pub snapshot: InfraSnapshot,
}

/// Stages snapshots through the buffer and mirrors them to the backend.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    buffer: StableBuffer,
    backend: Option<Arc<dyn PersistenceBackend>>,
    next_op: Arc<AtomicU64>,
    last_applied: Arc<AtomicU64>,
}

impl PersistenceCoordinator {
    pub fn new(buffer: StableBuffer) -> Self {
        Self { buffer, backend: None, next_op: Arc::new(AtomicU64::new(1)), last_applied: Arc::new(AtomicU64::new(0)) }
    }

    pub fn with_backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Allocate the next monotonic operation id.
    pub fn next_op_id(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::SeqCst)
    }

    /// Stage `snapshot` under `op_id`.
    ///
    /// Ids at or below the last applied one are skipped (idempotent replay).
    /// Buffer staging is transactional; the backend mirror is best-effort.
    pub async fn store(&self, op_id: u64, snapshot: InfraSnapshot) {
        let last = self.last_applied.load(Ordering::SeqCst);
        if op_id <= last {
            tracing::debug!(op_id, last, "skipping already-processed persistence operation");
            return;
        }

        let document = PersistedDocument { op_id, snapshot };
        let value = match serde_json::to_value(&document) {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(%error, "failed to serialize infrastructure snapshot");
                return;
            }
        };

        let staged = {
            let value = value.clone();
            self.buffer
                .run(move |state| {
                    Box::pin(async move {
                        state.insert(INFRA_STATE_KEY.to_string(), value);
                    })
                })
                .await
        };
        if let Err(error) = staged {
            tracing::warn!(%error, op_id, "failed to stage snapshot in buffer");
            return;
        }
        self.last_applied.store(op_id, Ordering::SeqCst);

        if let Some(backend) = &self.backend {
            if let Err(error) = backend.store(&value).await {
                tracing::warn!(%error, op_id, "persistence backend store failed (best-effort)");
            }
        }
    }

    /// Load the latest snapshot: backend first, buffer as fallback.
    pub async fn load(&self) -> Option<InfraSnapshot> {
        let value = match &self.backend {
            Some(backend) => match backend.load().await {
                Ok(Some(value)) => Some(value),
                Ok(None) => self.buffer.get(INFRA_STATE_KEY).await,
                Err(error) => {
                    tracing::warn!(%error, "persistence backend load failed; trying buffer");
                    self.buffer.get(INFRA_STATE_KEY).await
                }
            },
            None => self.buffer.get(INFRA_STATE_KEY).await,
        }?;

        match serde_json::from_value::<PersistedDocument>(value) {
            Ok(document) => {
                self.last_applied.fetch_max(document.op_id, Ordering::SeqCst);
                self.next_op.fetch_max(document.op_id + 1, Ordering::SeqCst);
                Some(document.snapshot)
            }
            Err(error) => {
                tracing::error!(%error, "stored infrastructure snapshot is unreadable");
                None
            }
        }
    }
}
