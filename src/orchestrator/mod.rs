//! Orchestrator loop.
//!
//! Every tick runs, in order: dispatch, stale recovery, the cycle flag and
//! liveness pruning. A failing step is logged and retried on the next tick;
//! it never stops the loop. All state lives in the store, so the loop can be
//! restarted at any time.

mod dispatch;
mod recovery;

pub use recovery::RecoveryReport;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::worker::{WorkerPool, shutdown_signalled};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub recovered: RecoveryReport,
    pub cycle_detected: bool,
    pub pruned: usize,
}

pub struct Orchestrator {
    store: Arc<dyn Database>,
    pool: Arc<WorkerPool>,
    config: OrchestratorConfig,
    cycle: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Database>, pool: Arc<WorkerPool>, config: OrchestratorConfig) -> Self {
        let (cycle, _) = watch::channel(false);
        Self {
            store,
            pool,
            config,
            cycle,
        }
    }

    /// Process-wide `cycle_detected` flag, re-derived every tick.
    pub fn cycle_signal(&self) -> watch::Receiver<bool> {
        self.cycle.subscribe()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One tick as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let store = self.store.as_ref();
        let mut report = TickReport::default();

        match dispatch::dispatch(store, &self.pool, now).await {
            Ok(n) => report.dispatched = n,
            Err(e) => warn!(error = %e, "Dispatch step failed, will retry next tick"),
        }

        match recovery::recover_stale(store, &self.pool, &self.config, now).await {
            Ok(r) => report.recovered = r,
            Err(e) => warn!(error = %e, "Stale recovery step failed, will retry next tick"),
        }

        match recovery::detect_cycle(store, self.config.cycle_threshold).await {
            Ok(detected) => {
                report.cycle_detected = detected;
                self.cycle.send_if_modified(|current| {
                    let changed = *current != detected;
                    *current = detected;
                    changed
                });
            }
            Err(e) => warn!(error = %e, "Cycle check failed, keeping previous flag"),
        }

        match self.prune(now).await {
            Ok(n) => report.pruned = n,
            Err(e) => warn!(error = %e, "Liveness pruning failed"),
        }

        debug!(
            dispatched = report.dispatched,
            requeued = report.recovered.requeued,
            failed = report.recovered.failed,
            cycle = report.cycle_detected,
            "Tick finished"
        );
        report
    }

    /// Recover tasks still held by local workers of a previous process.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, DatabaseError> {
        recovery::recover_orphans(self.store.as_ref(), &self.pool, Utc::now()).await
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let retention = chrono::Duration::from_std(self.config.liveness_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.store.prune_liveness(now - retention).await
    }

    /// Run startup recovery, then tick until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                tick_secs = self.config.tick_interval.as_secs(),
                max_workers = self.config.max_workers,
                "Orchestrator loop started"
            );

            if let Err(e) = self.recover_orphans().await {
                warn!(error = %e, "Startup orphan recovery failed, the stale scan will catch them");
            }

            let mut interval = tokio::time::interval(self.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown_signalled(&mut shutdown) => {
                        info!("Orchestrator loop stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::config::WorkerConfig;
    use crate::graph::{Goal, Task, TaskStatus, WorkerAddress};
    use crate::safety::SafetyLayer;
    use crate::store::{EventKind, LibSqlBackend};
    use crate::testing::{ScriptedLlm, ScriptedReply, memory_store};
    use crate::tools::ToolRegistry;
    use crate::worker::RunnerDeps;

    fn orchestrator(store: Arc<LibSqlBackend>, llm: ScriptedLlm, max_workers: usize) -> Orchestrator {
        let deps = RunnerDeps {
            store: store.clone(),
            llm: Arc::new(llm),
            tools: Arc::new(ToolRegistry::new()),
            safety: Arc::new(SafetyLayer::new(1024)),
            config: WorkerConfig::default(),
        };
        let config = OrchestratorConfig {
            max_workers,
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(store, Arc::new(WorkerPool::new(deps, max_workers)), config)
    }

    async fn single(store: &LibSqlBackend, task: impl FnOnce(&Goal) -> Task) -> Task {
        let goal = Goal::new("g", "");
        let task = task(&goal);
        store.insert_plan(&goal, &[task.clone()]).await.unwrap();
        task
    }

    #[tokio::test]
    async fn dispatches_by_priority_up_to_capacity() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::always(|_| ScriptedReply::Hang), 1);
        let goal = Goal::new("g", "");
        let low = Task::new(goal.id, "low").with_priority(1);
        let high = Task::new(goal.id, "high").with_priority(5);
        let mid = Task::new(goal.id, "mid").with_priority(3);
        store
            .insert_plan(&goal, &[low.clone(), high.clone(), mid.clone()])
            .await
            .unwrap();

        let report = orch.tick().await;
        assert_eq!(report.dispatched, 1);

        let high_now = store.get_task(high.id).await.unwrap().unwrap();
        assert!(high_now.status.is_owned());
        for id in [low.id, mid.id] {
            assert_eq!(
                store.get_task(id).await.unwrap().unwrap().status,
                TaskStatus::Pending
            );
        }
        let events = store.list_events_for_task(high.id, 10).await.unwrap();
        assert_eq!(events[0].kind, EventKind::Assigned);

        orch.pool().shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn dispatched_task_runs_to_completion() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::always(|_| ScriptedReply::text("ok")), 2);
        let task = single(&store, |g| Task::new(g.id, "quick")).await;

        assert_eq!(orch.tick().await.dispatched, 1);
        while !store.get_task(task.id).await.unwrap().unwrap().status.is_terminal() {
            tokio::task::yield_now().await;
        }
        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.unwrap().output, "ok");
    }

    #[tokio::test]
    async fn unclaimed_assignment_is_recovered_next_tick() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::new(vec![]), 0);
        let task = single(&store, |g| Task::new(g.id, "never claimed")).await;
        let t0 = Utc::now();
        store
            .assign_task(task.id, &WorkerAddress::local(), t0)
            .await
            .unwrap();

        // Within the assign timeout nothing happens.
        let report = orch.tick_at(t0 + ChronoDuration::seconds(30)).await;
        assert_eq!(report.recovered.total(), 0);

        let report = orch.tick_at(t0 + ChronoDuration::seconds(61)).await;
        assert_eq!(report.recovered.requeued, 1);

        let recovered = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, TaskStatus::Pending);
        assert_eq!(recovered.retry_count, 1);
        assert!(recovered.assigned_to.is_none());
        assert_eq!(store.stale_recovery_count(task.id).await.unwrap(), 1);
        assert_eq!(store.list_dispatchable(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn silent_running_task_is_recovered() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::new(vec![]), 0);
        let task = single(&store, |g| Task::new(g.id, "silent")).await;
        let worker = WorkerAddress::local();
        let t0 = Utc::now();
        store.assign_task(task.id, &worker, t0).await.unwrap();
        store.claim_task(task.id, &worker, t0).await.unwrap();

        let report = orch.tick_at(t0 + ChronoDuration::seconds(599)).await;
        assert_eq!(report.recovered.total(), 0);

        let report = orch.tick_at(t0 + ChronoDuration::seconds(601)).await;
        assert_eq!(report.recovered.requeued, 1);
        let events = store.list_events_for_task(task.id, 10).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::StaleRecovered);
        assert!(events.last().unwrap().message.contains("silent for 601s"));
    }

    #[tokio::test]
    async fn repeated_recovery_raises_cycle_flag() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::new(vec![]), 0);
        let task = single(&store, |g| Task::new(g.id, "flapping").with_max_retries(5)).await;
        let signal = orch.cycle_signal();
        let mut now = Utc::now();

        for round in 1..=2 {
            store
                .assign_task(task.id, &WorkerAddress::local(), now)
                .await
                .unwrap();
            now += ChronoDuration::seconds(61);
            let report = orch.tick_at(now).await;
            assert_eq!(report.recovered.requeued, 1);
            assert_eq!(report.cycle_detected, round >= 2);
        }
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn exhausted_recoveries_fail_the_task() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::new(vec![]), 0);
        let goal = Goal::new("g", "");
        let root = Task::new(goal.id, "root").with_max_retries(3);
        let child = Task::new(goal.id, "child").with_dependencies(vec![root.id]);
        store
            .insert_plan(&goal, &[root.clone(), child.clone()])
            .await
            .unwrap();
        let mut now = Utc::now();

        for _ in 0..3 {
            store
                .assign_task(root.id, &WorkerAddress::local(), now)
                .await
                .unwrap();
            now += ChronoDuration::seconds(61);
            orch.tick_at(now).await;
        }

        let root = store.get_task(root.id).await.unwrap().unwrap();
        assert_eq!(root.status, TaskStatus::Failed);
        let child = store.get_task(child.id).await.unwrap().unwrap();
        assert_eq!(child.status, TaskStatus::Blocked);
        assert_eq!(child.blocked_by, Some(root.id));
        // Exhausted tasks no longer count as a cycle.
        assert!(!orch.tick_at(now).await.cycle_detected);
    }

    #[tokio::test]
    async fn orphans_of_previous_process_are_recovered() {
        let store = memory_store().await;
        let orch = orchestrator(store.clone(), ScriptedLlm::new(vec![]), 0);
        let local = single(&store, |g| Task::new(g.id, "local")).await;
        let remote = single(&store, |g| Task::new(g.id, "remote")).await;
        store
            .assign_task(local.id, &WorkerAddress::local(), Utc::now())
            .await
            .unwrap();
        store
            .assign_task(remote.id, &WorkerAddress::sandbox("vm-1"), Utc::now())
            .await
            .unwrap();

        let report = orch.recover_orphans().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(
            store.get_task(local.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(
            store.get_task(remote.id).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let store = memory_store().await;
        let orch = Arc::new(orchestrator(store, ScriptedLlm::new(vec![]), 0));
        let (tx, rx) = watch::channel(false);
        let handle = orch.spawn(rx);
        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
