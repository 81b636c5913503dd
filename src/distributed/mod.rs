//! Distributed coordination.
//!
//! The [`DistributedCoordinator`] trait is the contract a backing store
//! (Redis, etcd, ...) must satisfy: last-write-wins keys, pub/sub, locks,
//! and leader election. [`memory`] ships an in-process implementation used
//! by tests and single-node deployments; [`buffer`] fans buffer writes out
//! across nodes; [`scheduler`] gates work to the elected leader.

pub mod buffer;
pub mod memory;
pub mod scheduler;

pub use buffer::{
    create_distributed_stable_buffer, DistributedBufferOptions, DistributedStableBuffer,
};
pub use memory::{InMemoryBackplane, InMemoryCoordinator};
pub use scheduler::{
    create_distributed_scheduler_config, run_as_distributed_scheduler,
    DistributedScheduler, DistributedSchedulerConfig,
};

use crate::error::BoxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator is not connected")]
    NotConnected,
    #[error("timed out waiting for lock {key:?}")]
    LockTimeout { key: String },
    #[error("lock {key:?} ttl {ttl:?} expired while held")]
    LockExpired { key: String, ttl: Duration },
    #[error("coordinator backend error: {0}")]
    Backend(String),
}

/// Callback invoked with each message on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle returned by `subscribe`; dropping it (or calling
/// [`unsubscribe`](Subscription::unsubscribe)) stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Upper bound on how long the lock may be held.
    pub ttl: Duration,
    /// How long to wait for a contended lock.
    pub wait_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(30), wait_timeout: Duration::from_secs(10) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    Leader,
    Follower,
}

/// Leadership callbacks for one election.
#[derive(Clone, Default)]
pub struct ElectionConfig {
    pub election_key: String,
    pub on_become_leader: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_lose_leadership: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ElectionConfig {
    pub fn new(election_key: impl Into<String>) -> Self {
        Self { election_key: election_key.into(), ..Self::default() }
    }
}

impl std::fmt::Debug for ElectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionConfig").field("election_key", &self.election_key).finish()
    }
}

/// Work executed under a distributed lock.
pub type LockedTask = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, BoxError>> + Send>;

/// Contract a distributed backend must provide.
#[async_trait]
pub trait DistributedCoordinator: Send + Sync {
    async fn connect(&self) -> Result<(), CoordinatorError>;
    async fn disconnect(&self) -> Result<(), CoordinatorError>;

    /// Last-write-wins key read.
    async fn get_state(&self, key: &str) -> Result<Option<Value>, CoordinatorError>;
    /// Last-write-wins key write.
    async fn set_state(&self, key: &str, value: Value) -> Result<(), CoordinatorError>;

    async fn publish(&self, channel: &str, message: Value) -> Result<(), CoordinatorError>;
    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, CoordinatorError>;

    /// Run `task` while holding the named lock.
    async fn with_lock(
        &self,
        key: &str,
        options: LockOptions,
        task: LockedTask,
    ) -> Result<Value, CoordinatorError>;

    async fn campaign_for_leader(
        &self,
        election: ElectionConfig,
    ) -> Result<LeaderStatus, CoordinatorError>;
    async fn resign_leadership(&self, election_key: &str) -> Result<(), CoordinatorError>;
}

/// How a node reconciles an incoming remote buffer state with its own.
#[derive(Clone)]
pub enum ConflictResolution {
    /// Adopt the remote state wholesale.
    LastWriteWins,
    /// Recursive object merge; remote values win at the leaves.
    Merge,
    Custom(ConflictMerger),
}

pub type ConflictMerger = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

impl std::fmt::Debug for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LastWriteWins => write!(f, "LastWriteWins"),
            Self::Merge => write!(f, "Merge"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Recursive object merge; `remote` wins wherever both sides hold a leaf.
pub fn deep_merge(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local_map), Value::Object(remote_map)) => {
            let mut merged = local_map.clone();
            for (key, remote_value) in remote_map {
                let value = match local_map.get(key) {
                    Some(local_value) => deep_merge(local_value, remote_value),
                    None => remote_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        _ => remote.clone(),
    }
}
