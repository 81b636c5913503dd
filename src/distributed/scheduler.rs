//! Leader-gated scheduling.
//!
//! In a multi-node deployment only one node should run periodic work
//! (pruning caches, persisting snapshots). A [`DistributedScheduler`]
//! campaigns in a named election before each run and executes the task only
//! while it holds leadership.

use super::{
    CoordinatorError, DistributedCoordinator, ElectionConfig, LeaderStatus,
};
use futures::future::BoxFuture;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DistributedSchedulerConfig {
    pub election_key: String,
}

/// Config constructor mirroring the scheduler entry points.
pub fn create_distributed_scheduler_config(
    election_key: impl Into<String>,
) -> DistributedSchedulerConfig {
    DistributedSchedulerConfig { election_key: election_key.into() }
}

/// Runs work only on the elected leader.
pub struct DistributedScheduler {
    coordinator: Arc<dyn DistributedCoordinator>,
    config: DistributedSchedulerConfig,
}

impl DistributedScheduler {
    pub fn new(
        coordinator: Arc<dyn DistributedCoordinator>,
        config: DistributedSchedulerConfig,
    ) -> Self {
        Self { coordinator, config }
    }

    /// Campaign, then run `task` if this node leads. Followers skip the
    /// task and return `None`.
    pub async fn run_if_leader<T>(
        &self,
        task: impl FnOnce() -> BoxFuture<'static, T> + Send,
    ) -> Result<Option<T>, CoordinatorError> {
        let status = self
            .coordinator
            .campaign_for_leader(ElectionConfig::new(self.config.election_key.clone()))
            .await?;
        match status {
            LeaderStatus::Leader => Ok(Some(task().await)),
            LeaderStatus::Follower => {
                tracing::debug!(
                    election = %self.config.election_key,
                    "not the leader; skipping scheduled work"
                );
                Ok(None)
            }
        }
    }

    pub async fn resign(&self) -> Result<(), CoordinatorError> {
        self.coordinator.resign_leadership(&self.config.election_key).await
    }
}

/// One-shot convenience: campaign and run `task` on the leader.
pub async fn run_as_distributed_scheduler<T>(
    coordinator: Arc<dyn DistributedCoordinator>,
    config: DistributedSchedulerConfig,
    task: impl FnOnce() -> BoxFuture<'static, T> + Send,
) -> Result<Option<T>, CoordinatorError> {
    DistributedScheduler::new(coordinator, config).run_if_leader(task).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::memory::{InMemoryBackplane, InMemoryCoordinator};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn scheduler(
        backplane: &InMemoryBackplane,
        id: &str,
    ) -> DistributedScheduler {
        let coordinator = Arc::new(InMemoryCoordinator::new(backplane.clone(), id));
        coordinator.connect().await.unwrap();
        DistributedScheduler::new(coordinator, create_distributed_scheduler_config("jobs"))
    }

    #[tokio::test]
    async fn only_the_leader_runs_work() {
        let backplane = InMemoryBackplane::new();
        let a = scheduler(&backplane, "a").await;
        let b = scheduler(&backplane, "b").await;
        let runs = Arc::new(AtomicUsize::new(0));

        let mut outcomes = Vec::new();
        for scheduler in [&a, &b] {
            let runs = runs.clone();
            let ran = scheduler
                .run_if_leader(move || {
                    Box::pin(async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        42
                    })
                })
                .await
                .unwrap();
            outcomes.push(ran);
        }
        assert_eq!(outcomes, vec![Some(42), None]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leadership_moves_after_resignation() {
        let backplane = InMemoryBackplane::new();
        let a = scheduler(&backplane, "a").await;
        let b = scheduler(&backplane, "b").await;

        let first = a.run_if_leader(|| Box::pin(async { "a ran" })).await.unwrap();
        assert_eq!(first, Some("a ran"));

        let skipped = b.run_if_leader(|| Box::pin(async { "b ran" })).await.unwrap();
        assert_eq!(skipped, None);

        a.resign().await.unwrap();
        let second = b.run_if_leader(|| Box::pin(async { "b ran" })).await.unwrap();
        assert_eq!(second, Some("b ran"));
    }

    #[tokio::test]
    async fn one_shot_entry_point() {
        let backplane = InMemoryBackplane::new();
        let coordinator = Arc::new(InMemoryCoordinator::new(backplane.clone(), "solo"));
        coordinator.connect().await.unwrap();

        let ran = run_as_distributed_scheduler(
            coordinator,
            create_distributed_scheduler_config("solo-jobs"),
            || Box::pin(async { 7 }),
        )
        .await
        .unwrap();
        assert_eq!(ran, Some(7));
    }
}
