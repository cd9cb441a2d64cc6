//! Operator interventions on individual tasks.
//!
//! Every action re-reads the task, checks its status against the action's
//! allowed set, requires a human reason and leaves an `admin` event behind.
//! None of them touch retry accounting.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AdminError, DatabaseError};
use crate::graph::{Task, TaskStatus};
use crate::store::{Database, EventKind, TaskEvent, TransitionOutcome};
use crate::worker::WorkerPool;

/// An administrative action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// Take the task away from its worker.
    Unassign,
    /// Put the task back in the queue and clear its stale-recovery history.
    Requeue,
    /// Fail the task permanently and block its dependents.
    ForceFail,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassign => "unassign",
            Self::Requeue => "requeue",
            Self::ForceFail => "force_fail",
        }
    }

    fn allowed(&self) -> &'static [TaskStatus] {
        match self {
            Self::Unassign | Self::Requeue => &[TaskStatus::Assigned, TaskStatus::Running],
            Self::ForceFail => &[
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::Running,
                TaskStatus::Blocked,
            ],
        }
    }

    fn allowed_str(&self) -> &'static str {
        match self {
            Self::Unassign | Self::Requeue => "assigned, running",
            Self::ForceFail => "pending, assigned, running, blocked",
        }
    }
}

/// The task after an administrative action.
#[derive(Debug, Clone, Serialize)]
pub struct AdminOutcome {
    pub task: Task,
    /// Dependents blocked by a forced failure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<Uuid>,
}

pub struct Admin {
    store: Arc<dyn Database>,
    pool: Option<Arc<WorkerPool>>,
}

impl Admin {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store, pool: None }
    }

    /// Also abort the in-process runner of a task taken from its worker.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub async fn unassign(&self, id: Uuid, reason: &str) -> Result<AdminOutcome, AdminError> {
        self.apply(AdminAction::Unassign, id, reason).await
    }

    pub async fn requeue(&self, id: Uuid, reason: &str) -> Result<AdminOutcome, AdminError> {
        self.apply(AdminAction::Requeue, id, reason).await
    }

    pub async fn force_fail(&self, id: Uuid, reason: &str) -> Result<AdminOutcome, AdminError> {
        self.apply(AdminAction::ForceFail, id, reason).await
    }

    pub async fn apply(
        &self,
        action: AdminAction,
        id: Uuid,
        reason: &str,
    ) -> Result<AdminOutcome, AdminError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AdminError::MissingReason {
                action: action.as_str(),
            });
        }

        let current = self
            .store
            .get_task(id)
            .await?
            .ok_or(AdminError::NotFound { id })?;
        check_eligible(action, &current)?;
        let previous_owner = current.assigned_to.clone();

        let outcome = match action {
            AdminAction::Unassign => self.store.release_task(id, None, false).await,
            AdminAction::Requeue => self.store.release_task(id, None, true).await,
            AdminAction::ForceFail => {
                self.store
                    .fail_task(id, None, &format!("force-failed by operator: {reason}"), false)
                    .await
            }
        }
        .map_err(|e| match e {
            DatabaseError::NotFound { .. } => AdminError::NotFound { id },
            other => AdminError::Database(other),
        })?;

        let (task, blocked) = match outcome {
            TransitionOutcome::Applied(task) | TransitionOutcome::Requeued(task) => (task, Vec::new()),
            TransitionOutcome::Failed { task, blocked } => (task, blocked),
            // The task moved on between the read and the write.
            other => {
                let task = other.task();
                return Err(ineligible(action, task));
            }
        };

        if let (Some(pool), Some(owner)) = (&self.pool, previous_owner.as_deref()) {
            pool.abort(owner, id).await;
        }

        let mut event = TaskEvent::new(&task, EventKind::Admin, format!("{}: {reason}", action.as_str()));
        event.worker = previous_owner.clone();
        if let Err(e) = self.store.record_event(&event).await {
            warn!(task_id = %id, error = %e, "Failed to record admin event");
        }

        info!(
            task_id = %id,
            action = action.as_str(),
            previous_owner = previous_owner.as_deref().unwrap_or("-"),
            status = %task.status,
            blocked = blocked.len(),
            reason,
            "Administrative action applied"
        );
        Ok(AdminOutcome { task, blocked })
    }
}

fn check_eligible(action: AdminAction, task: &Task) -> Result<(), AdminError> {
    if action.allowed().contains(&task.status) {
        Ok(())
    } else {
        Err(ineligible(action, task))
    }
}

fn ineligible(action: AdminAction, task: &Task) -> AdminError {
    AdminError::IneligibleStatus {
        id: task.id,
        status: task.status,
        action: action.as_str(),
        allowed: action.allowed_str(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::graph::{Goal, GoalStatus, WorkerAddress};
    use crate::testing::memory_store;

    async fn setup() -> (Arc<crate::store::LibSqlBackend>, Admin, Task, Task, WorkerAddress) {
        let store = memory_store().await;
        let goal = Goal::new("g", "");
        let parent = Task::new(goal.id, "parent");
        let child = Task::new(goal.id, "child").with_dependencies(vec![parent.id]);
        store
            .insert_plan(&goal, &[parent.clone(), child.clone()])
            .await
            .unwrap();
        let worker = WorkerAddress::local();
        assert!(store.assign_task(parent.id, &worker, Utc::now()).await.unwrap());
        let admin = Admin::new(store.clone());
        (store, admin, parent, child, worker)
    }

    #[tokio::test]
    async fn unassign_returns_task_to_queue() {
        let (store, admin, parent, _, worker) = setup().await;
        assert!(store.claim_task(parent.id, &worker, Utc::now()).await.unwrap());

        let out = admin.unassign(parent.id, "worker wedged").await.unwrap();
        assert_eq!(out.task.status, TaskStatus::Pending);
        assert!(out.task.assigned_to.is_none());
        assert!(out.task.started_at.is_none());
        assert_eq!(out.task.retry_count, 0);

        let events = store.list_events_for_task(parent.id, 10).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Admin);
        assert_eq!(last.message, "unassign: worker wedged");
        assert_eq!(last.worker.as_deref(), Some(worker.to_string().as_str()));
    }

    #[tokio::test]
    async fn requeue_clears_recovery_history() {
        let (store, admin, parent, _, worker) = setup().await;
        store
            .recover_stale_task(
                parent.id,
                TaskStatus::Assigned,
                Some(worker.to_string().as_str()),
                "silent",
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(store.stale_recovery_count(parent.id).await.unwrap(), 1);
        assert!(store.assign_task(parent.id, &worker, Utc::now()).await.unwrap());

        let out = admin.requeue(parent.id, "retry after fix").await.unwrap();
        assert_eq!(out.task.status, TaskStatus::Pending);
        assert_eq!(store.stale_recovery_count(parent.id).await.unwrap(), 0);
        assert!(out.task.failure_reason.is_none());
    }

    #[tokio::test]
    async fn force_fail_cascades_without_retry() {
        let (store, admin, parent, child, _) = setup().await;

        let out = admin.force_fail(parent.id, "bad input").await.unwrap();
        assert_eq!(out.task.status, TaskStatus::Failed);
        assert_eq!(out.blocked, vec![child.id]);
        assert!(out.task.failure_reason.unwrap().contains("bad input"));

        let child = store.get_task(child.id).await.unwrap().unwrap();
        assert_eq!(child.status, TaskStatus::Blocked);
        assert_eq!(child.blocked_by, Some(parent.id));
        let goal = store.get_goal(parent.goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
    }

    #[tokio::test]
    async fn ineligible_status_is_rejected_without_writes() {
        let (store, admin, _, child, _) = setup().await;

        let err = admin.unassign(child.id, "nope").await.unwrap_err();
        assert!(matches!(
            err,
            AdminError::IneligibleStatus {
                status: TaskStatus::Pending,
                action: "unassign",
                ..
            }
        ));
        let events = store.list_events_for_task(child.id, 10).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn reason_and_existence_are_required() {
        let (_, admin, parent, _, _) = setup().await;
        assert!(matches!(
            admin.force_fail(parent.id, "   ").await.unwrap_err(),
            AdminError::MissingReason { action: "force_fail" }
        ));
        let missing = Uuid::new_v4();
        assert!(matches!(
            admin.requeue(missing, "why").await.unwrap_err(),
            AdminError::NotFound { id } if id == missing
        ));
    }
}
