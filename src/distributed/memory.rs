//! In-process coordinator.
//!
//! Several [`InMemoryCoordinator`] handles sharing one
//! [`InMemoryBackplane`] behave like separate nodes against one backing
//! store, which is what the distributed-buffer and scheduler tests exercise.
//! Single-node deployments can use it as a no-dependency default.

use super::{
    CoordinatorError, DistributedCoordinator, ElectionConfig, LeaderStatus, LockOptions,
    LockedTask, MessageHandler, Subscription,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct BackplaneInner {
    state: Mutex<HashMap<String, Value>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    leaders: Mutex<HashMap<String, String>>,
}

/// Shared backing store for a set of in-memory "nodes".
#[derive(Clone, Default)]
pub struct InMemoryBackplane {
    inner: Arc<BackplaneInner>,
}

impl InMemoryBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        let mut channels = lock(&self.inner.channels);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn lock_entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.inner.locks);
        locks.entry(key.to_string()).or_default().clone()
    }
}

impl std::fmt::Debug for InMemoryBackplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackplane").finish()
    }
}

/// One node's view of the backplane.
pub struct InMemoryCoordinator {
    backplane: InMemoryBackplane,
    node_id: String,
    connected: AtomicBool,
    resign_hooks: Mutex<HashMap<String, Arc<dyn Fn() + Send + Sync>>>,
}

impl InMemoryCoordinator {
    pub fn new(backplane: InMemoryBackplane, node_id: impl Into<String>) -> Self {
        Self {
            backplane,
            node_id: node_id.into(),
            connected: AtomicBool::new(false),
            resign_hooks: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn ensure_connected(&self) -> Result<(), CoordinatorError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinatorError::NotConnected)
        }
    }
}

impl std::fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinator").field("node_id", &self.node_id).finish()
    }
}

#[async_trait]
impl DistributedCoordinator for InMemoryCoordinator {
    async fn connect(&self) -> Result<(), CoordinatorError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, CoordinatorError> {
        self.ensure_connected()?;
        Ok(lock(&self.backplane.inner.state).get(key).cloned())
    }

    async fn set_state(&self, key: &str, value: Value) -> Result<(), CoordinatorError> {
        self.ensure_connected()?;
        lock(&self.backplane.inner.state).insert(key.to_string(), value);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Value) -> Result<(), CoordinatorError> {
        self.ensure_connected()?;
        // No subscribers is not an error.
        let _ = self.backplane.sender(channel).send(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, CoordinatorError> {
        self.ensure_connected()?;
        let mut receiver = self.backplane.sender(channel).subscribe();
        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => handler(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(task))
    }

    async fn with_lock(
        &self,
        key: &str,
        options: LockOptions,
        task: LockedTask,
    ) -> Result<Value, CoordinatorError> {
        self.ensure_connected()?;
        let entry = self.backplane.lock_entry(key);
        let guard = tokio::time::timeout(options.wait_timeout, entry.lock())
            .await
            .map_err(|_| CoordinatorError::LockTimeout { key: key.to_string() })?;

        let outcome = tokio::time::timeout(options.ttl, task()).await;
        drop(guard);
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(CoordinatorError::Backend(error.to_string())),
            Err(_) => Err(CoordinatorError::LockExpired { key: key.to_string(), ttl: options.ttl }),
        }
    }

    async fn campaign_for_leader(
        &self,
        election: ElectionConfig,
    ) -> Result<LeaderStatus, CoordinatorError> {
        self.ensure_connected()?;
        let became_leader = {
            let mut leaders = lock(&self.backplane.inner.leaders);
            match leaders.get(&election.election_key) {
                Some(holder) if holder != &self.node_id => false,
                Some(_) => true, // already the leader
                None => {
                    leaders.insert(election.election_key.clone(), self.node_id.clone());
                    true
                }
            }
        };

        if became_leader {
            tracing::info!(node = %self.node_id, election = %election.election_key, "became leader");
            if let Some(hook) = &election.on_become_leader {
                hook();
            }
            if let Some(hook) = election.on_lose_leadership {
                lock(&self.resign_hooks).insert(election.election_key, hook);
            }
            Ok(LeaderStatus::Leader)
        } else {
            Ok(LeaderStatus::Follower)
        }
    }

    async fn resign_leadership(&self, election_key: &str) -> Result<(), CoordinatorError> {
        self.ensure_connected()?;
        let resigned = {
            let mut leaders = lock(&self.backplane.inner.leaders);
            match leaders.get(election_key) {
                Some(holder) if holder == &self.node_id => {
                    leaders.remove(election_key);
                    true
                }
                _ => false,
            }
        };
        if resigned {
            tracing::info!(node = %self.node_id, election = %election_key, "resigned leadership");
            if let Some(hook) = lock(&self.resign_hooks).remove(election_key) {
                hook();
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn node(backplane: &InMemoryBackplane, id: &str) -> InMemoryCoordinator {
        let coordinator = InMemoryCoordinator::new(backplane.clone(), id);
        coordinator.connect().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let coordinator = InMemoryCoordinator::new(InMemoryBackplane::new(), "n1");
        assert_eq!(
            coordinator.get_state("k").await.unwrap_err(),
            CoordinatorError::NotConnected
        );
        coordinator.connect().await.unwrap();
        assert!(coordinator.get_state("k").await.is_ok());
        coordinator.disconnect().await.unwrap();
        assert!(coordinator.get_state("k").await.is_err());
    }

    #[tokio::test]
    async fn state_is_shared_across_nodes() {
        let backplane = InMemoryBackplane::new();
        let a = node(&backplane, "a").await;
        let b = node(&backplane, "b").await;

        a.set_state("k", json!(1)).await.unwrap();
        assert_eq!(b.get_state("k").await.unwrap(), Some(json!(1)));

        // Last write wins.
        b.set_state("k", json!(2)).await.unwrap();
        assert_eq!(a.get_state("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscribers() {
        let backplane = InMemoryBackplane::new();
        let a = node(&backplane, "a").await;
        let b = node(&backplane, "b").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = b
            .subscribe(
                "events",
                Arc::new(move |message| seen_clone.lock().unwrap().push(message)),
            )
            .await
            .unwrap();

        a.publish("events", json!({"n": 1})).await.unwrap();
        a.publish("events", json!({"n": 2})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 1}), json!({"n": 2})]);

        subscription.unsubscribe();
        a.publish("events", json!({"n": 3})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lock_serializes_critical_sections() {
        let backplane = InMemoryBackplane::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let backplane = backplane.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let coordinator = node(&backplane, &format!("n{}", i)).await;
                coordinator
                    .with_lock(
                        "critical",
                        LockOptions::default(),
                        Box::new(move || {
                            Box::pin(async move {
                                let current = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(current, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                concurrent.fetch_sub(1, Ordering::SeqCst);
                                Ok(json!(null))
                            })
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "lock must serialize holders");
    }

    #[tokio::test]
    async fn lock_wait_timeout_fires() {
        let backplane = InMemoryBackplane::new();
        let holder = node(&backplane, "holder").await;
        let waiter = node(&backplane, "waiter").await;

        let hold = tokio::spawn(async move {
            holder
                .with_lock(
                    "slow",
                    LockOptions { ttl: Duration::from_secs(5), wait_timeout: Duration::from_secs(5) },
                    Box::new(|| {
                        Box::pin(async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok(json!(null))
                        })
                    }),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = waiter
            .with_lock(
                "slow",
                LockOptions {
                    ttl: Duration::from_secs(5),
                    wait_timeout: Duration::from_millis(30),
                },
                Box::new(|| Box::pin(async { Ok(json!(null)) })),
            )
            .await;
        assert_eq!(result.unwrap_err(), CoordinatorError::LockTimeout { key: "slow".into() });
        hold.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_ttl_bounds_hold_time() {
        let backplane = InMemoryBackplane::new();
        let coordinator = node(&backplane, "n").await;

        let result = coordinator
            .with_lock(
                "bounded",
                LockOptions {
                    ttl: Duration::from_millis(30),
                    wait_timeout: Duration::from_secs(1),
                },
                Box::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!(null))
                    })
                }),
            )
            .await;
        assert!(matches!(result.unwrap_err(), CoordinatorError::LockExpired { .. }));
    }

    #[tokio::test]
    async fn single_leader_until_resignation() {
        let backplane = InMemoryBackplane::new();
        let a = node(&backplane, "a").await;
        let b = node(&backplane, "b").await;

        let a_lost = Arc::new(AtomicUsize::new(0));
        let a_lost_clone = a_lost.clone();
        let mut election = ElectionConfig::new("jobs");
        election.on_lose_leadership = Some(Arc::new(move || {
            a_lost_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(a.campaign_for_leader(election).await.unwrap(), LeaderStatus::Leader);
        assert_eq!(
            b.campaign_for_leader(ElectionConfig::new("jobs")).await.unwrap(),
            LeaderStatus::Follower
        );
        // Re-campaigning as the incumbent stays leader.
        assert_eq!(
            a.campaign_for_leader(ElectionConfig::new("jobs")).await.unwrap(),
            LeaderStatus::Leader
        );

        // A non-leader resignation is a no-op.
        b.resign_leadership("jobs").await.unwrap();
        assert_eq!(a_lost.load(Ordering::SeqCst), 0);

        a.resign_leadership("jobs").await.unwrap();
        assert_eq!(a_lost.load(Ordering::SeqCst), 1);
        assert_eq!(
            b.campaign_for_leader(ElectionConfig::new("jobs")).await.unwrap(),
            LeaderStatus::Leader
        );
    }
}
