//! Bounded pool of concurrently executing task runners.
//!
//! Every spawned runner is wrapped in a supervising task that reports a
//! terminal outcome even when the runner panics. Runners are tracked by
//! worker address so the orchestrator can abort one it has recovered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::graph::WorkerAddress;
use crate::store::{EventKind, TaskEvent};
use crate::worker::runner::{RunOutcome, RunnerDeps, TaskRunner};

/// How often `shutdown` checks whether runners have drained.
const DRAIN_POLL: Duration = Duration::from_millis(50);

struct TrackedWorker {
    task_id: Uuid,
    runner: AbortHandle,
}

/// Handle to a spawned runner.
pub struct WorkerHandle {
    pub address: WorkerAddress,
    pub task_id: Uuid,
    join: JoinHandle<Option<RunOutcome>>,
}

impl WorkerHandle {
    /// Wait for the run to end. `None` if the runner panicked or was aborted.
    pub async fn join(self) -> Option<RunOutcome> {
        self.join.await.ok().flatten()
    }
}

pub struct WorkerPool {
    deps: RunnerDeps,
    max_workers: usize,
    workers: Arc<RwLock<HashMap<String, TrackedWorker>>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(deps: RunnerDeps, max_workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            deps,
            max_workers,
            workers: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Fresh address for a new in-process worker. Addresses are never reused.
    pub fn allocate_address(&self) -> WorkerAddress {
        WorkerAddress::local()
    }

    pub async fn available_capacity(&self) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        self.max_workers
            .saturating_sub(self.workers.read().await.len())
    }

    pub async fn active_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_alive(&self, address: &str) -> bool {
        self.workers.read().await.contains_key(address)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Start a runner for an assigned task. Returns immediately.
    pub async fn spawn(
        &self,
        task_id: Uuid,
        address: WorkerAddress,
    ) -> Result<WorkerHandle, TaskError> {
        if self.is_shutting_down() {
            return Err(TaskError::ShuttingDown);
        }

        // Held across spawn so the supervisor cannot deregister before we register.
        let mut workers = self.workers.write().await;
        if workers.len() >= self.max_workers {
            return Err(TaskError::PoolFull {
                max: self.max_workers,
            });
        }

        let runner = TaskRunner::new(
            task_id,
            address.clone(),
            self.deps.clone(),
            self.shutdown.subscribe(),
        );
        let inner = tokio::spawn(runner.run());
        let abort = inner.abort_handle();

        let deps = self.deps.clone();
        let registry = Arc::clone(&self.workers);
        let key = address.to_string();
        let supervised = address.clone();
        let join = tokio::spawn(async move {
            let outcome = match inner.await {
                Ok(outcome) => {
                    debug!(task_id = %task_id, worker = %supervised, outcome = ?outcome, "Runner finished");
                    Some(outcome)
                }
                Err(e) if e.is_panic() => {
                    report_panic(&deps, task_id, &supervised, &e.to_string()).await;
                    None
                }
                Err(_) => {
                    debug!(task_id = %task_id, worker = %supervised, "Runner aborted");
                    None
                }
            };
            registry.write().await.remove(&key);
            outcome
        });

        workers.insert(
            address.to_string(),
            TrackedWorker {
                task_id,
                runner: abort,
            },
        );
        debug!(task_id = %task_id, worker = %address, "Runner spawned");

        Ok(WorkerHandle {
            address,
            task_id,
            join,
        })
    }

    /// Abort the runner at `address` if it is still running `task_id`.
    pub async fn abort(&self, address: &str, task_id: Uuid) -> bool {
        let workers = self.workers.read().await;
        match workers.get(address) {
            Some(tracked) if tracked.task_id == task_id => {
                tracked.runner.abort();
                info!(task_id = %task_id, worker = address, "Runner aborted");
                true
            }
            _ => false,
        }
    }

    /// Signal every runner to stop, wait up to `grace`, then abort the rest.
    /// Returns how many runners had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let _ = self.shutdown.send(true);
        let active = self.active_count().await;
        if active > 0 {
            info!(active, grace_secs = grace.as_secs(), "Waiting for runners to release their tasks");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.workers.read().await.is_empty() {
                return 0;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let workers = self.workers.read().await;
        for (address, tracked) in workers.iter() {
            warn!(task_id = %tracked.task_id, worker = %address, "Runner did not stop in time, aborting");
            tracked.runner.abort();
        }
        workers.len()
    }
}

/// Terminal report for a runner that panicked.
async fn report_panic(deps: &RunnerDeps, task_id: Uuid, worker: &WorkerAddress, panic: &str) {
    error!(task_id = %task_id, worker = %worker, panic, "Runner panicked");
    let reason = format!("worker panicked: {panic}");

    match deps.store.get_task(task_id).await {
        Ok(Some(task)) => {
            let event = TaskEvent::new(&task, EventKind::Panicked, &reason).with_worker(worker);
            if let Err(e) = deps.store.record_event(&event).await {
                warn!(task_id = %task_id, error = %e, "Failed to record panic event");
            }
        }
        Ok(None) => return,
        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to load panicked task"),
    }

    if let Err(e) = deps
        .store
        .fail_task(task_id, Some(worker), &reason, true)
        .await
    {
        warn!(task_id = %task_id, error = %e, "Failed to record panic failure");
    }
}
