//! `Database` trait: the single async interface the orchestrator persists through.
//!
//! Every state-changing task operation is one transaction on the backend
//! side. Callers get back a [`TransitionOutcome`] describing what actually
//! happened, which may differ from what they asked for when another actor
//! got there first.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::graph::{Goal, RuntimeKind, Task, TaskResult, TaskStatus, WorkerAddress};

/// Result of a task state transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The requested transition was written.
    Applied(Task),
    /// The task went back to `pending` for another attempt.
    Requeued(Task),
    /// The task failed permanently; `blocked` lists the dependents blocked with it.
    Failed { task: Task, blocked: Vec<Uuid> },
    /// The task was already terminal. Nothing was written.
    Unchanged(Task),
    /// The caller no longer owns the task. Nothing was written.
    NotOwner(Task),
    /// The task's status does not allow the transition. Nothing was written.
    Rejected(Task),
}

impl TransitionOutcome {
    pub fn task(&self) -> &Task {
        match self {
            Self::Applied(t)
            | Self::Requeued(t)
            | Self::Unchanged(t)
            | Self::NotOwner(t)
            | Self::Rejected(t) => t,
            Self::Failed { task, .. } => task,
        }
    }
}

/// Last time a worker address was seen alive.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessRecord {
    pub address: String,
    pub runtime_kind: RuntimeKind,
    pub task_id: Option<Uuid>,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Kind of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Assigned,
    Claimed,
    Progress,
    ToolCall,
    Completed,
    Failed,
    Retried,
    Released,
    StaleRecovered,
    Panicked,
    Admin,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Claimed => "claimed",
            Self::Progress => "progress",
            Self::ToolCall => "tool_call",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retried => "retried",
            Self::Released => "released",
            Self::StaleRecovered => "stale_recovered",
            Self::Panicked => "panicked",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "claimed" => Ok(Self::Claimed),
            "progress" => Ok(Self::Progress),
            "tool_call" => Ok(Self::ToolCall),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retried" => Ok(Self::Retried),
            "released" => Ok(Self::Released),
            "stale_recovered" => Ok(Self::StaleRecovered),
            "panicked" => Ok(Self::Panicked),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One line of a task's persisted narrative.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub goal_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub kind: EventKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task: &Task, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            goal_id: task.goal_id,
            worker: task.assigned_to.clone(),
            kind,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker: &WorkerAddress) -> Self {
        self.worker = Some(worker.to_string());
        self
    }
}

/// Backend-agnostic persistence for goals, tasks, liveness and events.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Goals ───────────────────────────────────────────────────────

    async fn create_goal(&self, goal: &Goal) -> Result<(), DatabaseError>;

    async fn get_goal(&self, id: Uuid) -> Result<Option<Goal>, DatabaseError>;

    async fn list_goals(&self) -> Result<Vec<Goal>, DatabaseError>;

    /// Insert a goal and all of its tasks in one transaction.
    async fn insert_plan(&self, goal: &Goal, tasks: &[Task]) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Add a task to an existing goal. Every dependency must already exist
    /// and belong to the same goal.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    async fn list_tasks_for_goal(&self, goal_id: Uuid) -> Result<Vec<Task>, DatabaseError>;

    async fn list_tasks_by_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Pending tasks whose dependencies are all completed, in dispatch order.
    async fn list_dispatchable(&self, limit: usize) -> Result<Vec<Task>, DatabaseError>;

    // ── Transitions ─────────────────────────────────────────────────

    /// `pending → assigned`, creating the worker's liveness record.
    /// Returns false if the task was no longer pending.
    async fn assign_task(
        &self,
        id: Uuid,
        worker: &WorkerAddress,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `assigned → running` for the expected worker. Exactly one concurrent
    /// caller can win.
    async fn claim_task(
        &self,
        id: Uuid,
        worker: &WorkerAddress,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `running → completed`. `owner` is checked when given.
    async fn complete_task(
        &self,
        id: Uuid,
        owner: Option<&WorkerAddress>,
        result: &TaskResult,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Retry or permanently fail (with cascade). `owner` is checked when given.
    async fn fail_task(
        &self,
        id: Uuid,
        owner: Option<&WorkerAddress>,
        reason: &str,
        retryable: bool,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Owned task back to `pending` without retry accounting. With
    /// `reset_recoveries` the stale-recovery counter and failure reason are
    /// cleared as well.
    async fn release_task(
        &self,
        id: Uuid,
        owner: Option<&WorkerAddress>,
        reset_recoveries: bool,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Counted stale recovery of a task observed as `expected` held by
    /// `expected_owner`. Nothing is written if the task moved on since.
    async fn recover_stale_task(
        &self,
        id: Uuid,
        expected: TaskStatus,
        expected_owner: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DatabaseError>;

    // ── Liveness ────────────────────────────────────────────────────

    /// Best-effort heartbeat.
    async fn record_liveness(
        &self,
        worker: &WorkerAddress,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn list_liveness(&self) -> Result<Vec<LivenessRecord>, DatabaseError>;

    /// Delete records older than `cutoff` whose worker holds no task.
    async fn prune_liveness(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Stale-recovery counters ─────────────────────────────────────

    async fn stale_recovery_count(&self, task_id: Uuid) -> Result<u32, DatabaseError>;

    async fn stale_recovery_counts(&self) -> Result<HashMap<Uuid, u32>, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    async fn record_event(&self, event: &TaskEvent) -> Result<(), DatabaseError>;

    async fn list_events_for_task(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TaskEvent>, DatabaseError>;

    /// Timestamp of the most recent event of every goal that has one.
    async fn latest_event_per_goal(&self) -> Result<HashMap<Uuid, DateTime<Utc>>, DatabaseError>;
}
