//! Buffer replication across nodes.
//!
//! A [`DistributedStableBuffer`] wraps a local [`StableBuffer`]: every
//! committed transaction is written to the coordinator's shared key and
//! announced on a sync channel. Peers reconcile incoming states under their
//! configured [`ConflictResolution`]. Messages carry the origin `node_id`;
//! a node ignores its own announcements, and while reconciling it raises an
//! `is_syncing` flag so the reconciliation write is not echoed back out.

use super::{deep_merge, ConflictResolution, CoordinatorError, DistributedCoordinator, Subscription};
use crate::buffer::{BufferError, BufferState, StableBuffer};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct DistributedBufferOptions {
    /// Shared key holding the replicated state.
    pub state_key: String,
    /// Pub/sub channel for sync announcements.
    pub channel: String,
    /// This node's identity in announcements.
    pub node_id: String,
    pub conflict_resolution: ConflictResolution,
}

impl DistributedBufferOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            state_key: "stable_buffer:state".to_string(),
            channel: "stable_buffer:sync".to_string(),
            node_id: node_id.into(),
            conflict_resolution: ConflictResolution::LastWriteWins,
        }
    }

    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }
}

/// A stable buffer whose commits fan out through a coordinator.
pub struct DistributedStableBuffer {
    local: StableBuffer,
    coordinator: Arc<dyn DistributedCoordinator>,
    options: DistributedBufferOptions,
    is_syncing: Arc<AtomicBool>,
    _subscription: Subscription,
    _reconciler: tokio::task::JoinHandle<()>,
}

/// Build a distributed buffer: adopt the current shared state, then follow
/// the sync channel.
pub async fn create_distributed_stable_buffer(
    coordinator: Arc<dyn DistributedCoordinator>,
    options: DistributedBufferOptions,
) -> Result<DistributedStableBuffer, CoordinatorError> {
    let local = StableBuffer::default();
    let is_syncing = Arc::new(AtomicBool::new(false));

    // Initial sync: adopt whatever the cluster already holds.
    if let Some(shared) = coordinator.get_state(&options.state_key).await? {
        adopt(&local, &options.conflict_resolution, &shared, &is_syncing).await;
    }

    // Handlers are synchronous; reconciliation needs the async buffer, so
    // messages flow through a channel into a reconciler task.
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let subscription = coordinator
        .subscribe(
            &options.channel,
            Arc::new(move |message| {
                let _ = tx.send(message);
            }),
        )
        .await?;

    let reconciler = {
        let local = local.clone();
        let resolution = options.conflict_resolution.clone();
        let node_id = options.node_id.clone();
        let is_syncing = is_syncing.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let origin = message.get("node_id").and_then(Value::as_str);
                if origin == Some(node_id.as_str()) {
                    continue; // own announcement
                }
                let Some(state) = message.get("state") else {
                    tracing::warn!("sync message without state; ignoring");
                    continue;
                };
                adopt(&local, &resolution, state, &is_syncing).await;
            }
        })
    };

    Ok(DistributedStableBuffer {
        local,
        coordinator,
        options,
        is_syncing,
        _subscription: subscription,
        _reconciler: reconciler,
    })
}

impl DistributedStableBuffer {
    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    /// Run a transaction locally, then replicate the committed state.
    ///
    /// Replication is best-effort: coordinator failures are logged and the
    /// local commit stands.
    pub async fn run<T>(
        &self,
        transaction: impl for<'a> FnOnce(&'a mut BufferState) -> BoxFuture<'a, T> + Send,
    ) -> Result<T, BufferError>
    where
        T: Send,
    {
        let value = self.local.run(transaction).await?;
        if !self.is_syncing.load(Ordering::SeqCst) {
            self.replicate().await;
        }
        Ok(value)
    }

    pub async fn read(&self) -> BufferState {
        self.local.read().await
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.local.get(key).await
    }

    async fn replicate(&self) {
        let state = state_to_value(&self.local.read().await);
        if let Err(error) =
            self.coordinator.set_state(&self.options.state_key, state.clone()).await
        {
            tracing::warn!(%error, "failed to write shared buffer state");
            return;
        }
        let announcement = json!({ "node_id": self.options.node_id, "state": state });
        if let Err(error) = self.coordinator.publish(&self.options.channel, announcement).await {
            tracing::warn!(%error, "failed to announce buffer state");
        }
    }
}

/// Reconcile `remote` into the local buffer under the given resolution.
async fn adopt(
    local: &StableBuffer,
    resolution: &ConflictResolution,
    remote: &Value,
    is_syncing: &AtomicBool,
) {
    is_syncing.store(true, Ordering::SeqCst);
    let resolution = resolution.clone();
    let remote = remote.clone();
    let outcome = local
        .run(move |state| {
            Box::pin(async move {
                let merged = match &resolution {
                    ConflictResolution::LastWriteWins => remote.clone(),
                    ConflictResolution::Merge => deep_merge(&state_to_value(state), &remote),
                    ConflictResolution::Custom(merger) => {
                        merger(&state_to_value(state), &remote)
                    }
                };
                *state = value_to_state(&merged);
            })
        })
        .await;
    if let Err(error) = outcome {
        tracing::warn!(%error, "buffer reconciliation transaction failed");
    }
    is_syncing.store(false, Ordering::SeqCst);
}

fn state_to_value(state: &BufferState) -> Value {
    Value::Object(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
}

fn value_to_state(value: &Value) -> BufferState {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BufferState::new(),
    }
}
