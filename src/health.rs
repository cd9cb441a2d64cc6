//! Read-time health classification.
//!
//! [`derive`] is a pure function of a [`StoreSnapshot`] and the current time.
//! Nothing here writes to the store; the only persisted inputs are task
//! timestamps, liveness records, recovery counters and event times.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::HealthThresholds;
use crate::error::DatabaseError;
use crate::graph::{Goal, GoalStatus, RuntimeKind, Task, TaskStatus};
use crate::store::{Database, LivenessRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSeverity {
    Ok,
    /// Assigned for longer than the dispatch-deadlock threshold without a claim.
    DispatchDeadlock,
    /// Running past its own timeout.
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskHealth {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_age_secs: Option<u64>,
    pub severity: TaskSeverity,
    pub retry_count: u32,
    pub stale_recoveries: u32,
    /// Root failed task of the cascade that blocked this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Active,
    Idle,
    Stale,
    Zombie,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub address: String,
    pub runtime_kind: RuntimeKind,
    pub silence_secs: u64,
    pub active_tasks: usize,
    pub task_ids: Vec<Uuid>,
    pub state: WorkerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalHealthStatus {
    Ok,
    Stalled,
    Blocked,
    DispatchFailure,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalHealth {
    pub id: Uuid,
    pub title: String,
    pub status: GoalHealthStatus,
    /// Task count per status.
    pub counts: BTreeMap<String, usize>,
    pub overdue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
}

/// The diagnostics projection served to dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<TaskHealth>,
    pub workers: Vec<WorkerHealth>,
    pub goals: Vec<GoalHealth>,
    pub cycle_detected: bool,
    pub total_stale_recoveries: u32,
}

/// Everything [`derive`] reads, loaded in one go.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub goals: Vec<Goal>,
    pub tasks: Vec<Task>,
    pub liveness: Vec<LivenessRecord>,
    pub stale_counts: HashMap<Uuid, u32>,
    pub latest_events: HashMap<Uuid, DateTime<Utc>>,
}

impl StoreSnapshot {
    pub async fn load(store: &dyn Database) -> Result<Self, DatabaseError> {
        Ok(Self {
            goals: store.list_goals().await?,
            tasks: store.list_tasks().await?,
            liveness: store.list_liveness().await?,
            stale_counts: store.stale_recovery_counts().await?,
            latest_events: store.latest_event_per_goal().await?,
        })
    }
}

/// Load a snapshot and derive diagnostics as of now.
pub async fn diagnostics(
    store: &dyn Database,
    thresholds: &HealthThresholds,
    cycle_detected: bool,
) -> Result<DiagnosticsSnapshot, DatabaseError> {
    let snapshot = StoreSnapshot::load(store).await?;
    Ok(derive(&snapshot, Utc::now(), thresholds, cycle_detected))
}

fn age(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

fn classify_task(task: &Task, now: DateTime<Utc>, thresholds: &HealthThresholds, recoveries: u32) -> TaskHealth {
    let dispatch_age = match (task.status, task.assigned_at) {
        (TaskStatus::Assigned, Some(at)) => Some(age(now, at)),
        _ => None,
    };
    let run_age = match (task.status, task.started_at) {
        (TaskStatus::Running, Some(at)) => Some(age(now, at)),
        _ => None,
    };

    let severity = if dispatch_age.is_some_and(|a| a > thresholds.dispatch_deadlock) {
        TaskSeverity::DispatchDeadlock
    } else if run_age.is_some_and(|a| a > task.timeout) {
        TaskSeverity::TimedOut
    } else {
        TaskSeverity::Ok
    };

    TaskHealth {
        id: task.id,
        goal_id: task.goal_id,
        title: task.title.clone(),
        status: task.status,
        assigned_to: task.assigned_to.clone(),
        dispatch_age_secs: dispatch_age.map(|a| a.as_secs()),
        run_age_secs: run_age.map(|a| a.as_secs()),
        severity,
        retry_count: task.retry_count,
        stale_recoveries: recoveries,
        blocked_by: task.blocked_by,
        failure_reason: task.failure_reason.clone(),
    }
}

fn classify_worker(
    record: &LivenessRecord,
    task_ids: Vec<Uuid>,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
) -> WorkerHealth {
    let silence = age(now, record.last_checked_at);
    let holding = !task_ids.is_empty();
    let state = if !holding && silence > thresholds.worker_stale {
        WorkerState::Idle
    } else if !holding {
        WorkerState::Active
    } else if silence > thresholds.worker_zombie {
        WorkerState::Zombie
    } else if silence > thresholds.worker_stale {
        WorkerState::Stale
    } else {
        WorkerState::Active
    };
    WorkerHealth {
        address: record.address.clone(),
        runtime_kind: record.runtime_kind,
        silence_secs: silence.as_secs(),
        active_tasks: task_ids.len(),
        task_ids,
        state,
    }
}

fn classify_goal(
    goal: &Goal,
    tasks: &[&Task],
    task_health: &HashMap<Uuid, TaskSeverity>,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
) -> GoalHealth {
    let mut counts = BTreeMap::new();
    for task in tasks {
        *counts.entry(task.status.as_str().to_string()).or_insert(0) += 1;
    }

    let status = match goal.status {
        GoalStatus::Completed => GoalHealthStatus::Completed,
        GoalStatus::Failed => GoalHealthStatus::Failed,
        GoalStatus::Active => {
            let deadlocked = tasks
                .iter()
                .any(|t| task_health.get(&t.id) == Some(&TaskSeverity::DispatchDeadlock));
            let unfinished: Vec<&&Task> = tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .collect();
            let all_blocked = !unfinished.is_empty()
                && unfinished.iter().all(|t| t.status == TaskStatus::Blocked);
            let has_active = tasks.iter().any(|t| t.status.is_owned());
            let quiet_since = last_event_at.unwrap_or(goal.updated_at);

            if deadlocked {
                GoalHealthStatus::DispatchFailure
            } else if all_blocked {
                GoalHealthStatus::Blocked
            } else if has_active && age(now, quiet_since) > thresholds.worker_zombie {
                GoalHealthStatus::Stalled
            } else {
                GoalHealthStatus::Ok
            }
        }
    };

    GoalHealth {
        id: goal.id,
        title: goal.title.clone(),
        status,
        counts,
        overdue: goal.status == GoalStatus::Active && goal.deadline.is_some_and(|d| d < now),
        last_event_at,
    }
}

/// Classify every unfinished task, every known worker and every goal.
///
/// Failed tasks stay in the task list so blocked dependents can be traced
/// to their root.
pub fn derive(
    snapshot: &StoreSnapshot,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
    cycle_detected: bool,
) -> DiagnosticsSnapshot {
    let tasks: Vec<TaskHealth> = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed || !t.status.is_terminal())
        .map(|t| {
            let recoveries = snapshot.stale_counts.get(&t.id).copied().unwrap_or(0);
            classify_task(t, now, thresholds, recoveries)
        })
        .collect();
    let severities: HashMap<Uuid, TaskSeverity> = tasks.iter().map(|t| (t.id, t.severity)).collect();

    let mut held: HashMap<&str, Vec<Uuid>> = HashMap::new();
    for task in snapshot.tasks.iter().filter(|t| t.status.is_owned()) {
        if let Some(owner) = task.assigned_to.as_deref() {
            held.entry(owner).or_default().push(task.id);
        }
    }
    let workers = snapshot
        .liveness
        .iter()
        .map(|record| {
            let ids = held.get(record.address.as_str()).cloned().unwrap_or_default();
            classify_worker(record, ids, now, thresholds)
        })
        .collect();

    let mut by_goal: HashMap<Uuid, Vec<&Task>> = HashMap::new();
    for task in &snapshot.tasks {
        by_goal.entry(task.goal_id).or_default().push(task);
    }
    let goals = snapshot
        .goals
        .iter()
        .map(|goal| {
            let children = by_goal.get(&goal.id).map(Vec::as_slice).unwrap_or(&[]);
            let last_event = snapshot.latest_events.get(&goal.id).copied();
            classify_goal(goal, children, &severities, last_event, now, thresholds)
        })
        .collect();

    DiagnosticsSnapshot {
        generated_at: now,
        tasks,
        workers,
        goals,
        cycle_detected,
        total_stale_recoveries: snapshot.stale_counts.values().sum(),
    }
}
