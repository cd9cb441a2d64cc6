//! Pure state-transition rules for the task graph.
//!
//! Nothing here touches the store. The libsql backend loads rows, asks these
//! functions what to do, and applies the answer inside one transaction.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::graph::model::{GoalStatus, Task, TaskStatus};

/// Whether the state machine allows `from → to`.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    match from {
        Pending => matches!(to, Assigned | Blocked | Cancelled | Failed),
        Assigned => matches!(to, Running | Pending | Failed | Blocked | Cancelled),
        Running => matches!(to, Completed | Failed | Pending | Blocked | Cancelled),
        Blocked => matches!(to, Failed | Cancelled),
        Completed | Failed | Cancelled => false,
    }
}

/// What `complete_task` should do for a task in `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteDecision {
    Apply,
    /// Duplicate or late signal on a finished task.
    AlreadyTerminal,
    Reject,
}

pub fn decide_complete(status: TaskStatus) -> CompleteDecision {
    if status.is_terminal() {
        CompleteDecision::AlreadyTerminal
    } else if can_transition(status, TaskStatus::Completed) {
        CompleteDecision::Apply
    } else {
        CompleteDecision::Reject
    }
}

/// What `fail_task` should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to pending with the new retry count.
    Retry { retry_count: u32 },
    /// Permanent failure, cascade to dependents.
    Fail,
    AlreadyTerminal,
}

pub fn decide_failure(task: &Task, retryable: bool) -> FailureDecision {
    if task.status.is_terminal() {
        return FailureDecision::AlreadyTerminal;
    }
    if retryable && task.retry_count < task.max_retries && task.status != TaskStatus::Blocked {
        FailureDecision::Retry {
            retry_count: task.retry_count.saturating_add(1),
        }
    } else {
        FailureDecision::Fail
    }
}

/// What stale recovery should do given the counter value before this recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Requeue { recoveries: u32 },
    Exhausted { recoveries: u32 },
}

pub fn decide_recovery(previous_recoveries: u32, max_retries: u32) -> RecoveryDecision {
    let recoveries = previous_recoveries.saturating_add(1);
    if recoveries >= max_retries {
        RecoveryDecision::Exhausted { recoveries }
    } else {
        RecoveryDecision::Requeue { recoveries }
    }
}

/// Repeated recovery of a task that is still alive points at a structural
/// dispatch problem rather than a flaky worker.
pub fn is_cycle_suspect(recoveries: u32, threshold: u32, task: &Task) -> bool {
    recoveries >= threshold && recoveries < task.max_retries && !task.status.is_terminal()
}

/// A pending task whose dependencies are all completed.
pub fn is_dispatch_eligible(task: &Task, statuses: &HashMap<Uuid, TaskStatus>) -> bool {
    task.status == TaskStatus::Pending
        && task
            .dependencies
            .iter()
            .all(|dep| statuses.get(dep) == Some(&TaskStatus::Completed))
}

/// Priority descending, then oldest first.
pub fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Eligible tasks in dispatch order, at most `limit`.
pub fn select_dispatchable<'a>(
    candidates: &'a [Task],
    statuses: &HashMap<Uuid, TaskStatus>,
    limit: usize,
) -> Vec<&'a Task> {
    let mut eligible: Vec<&Task> = candidates
        .iter()
        .filter(|t| is_dispatch_eligible(t, statuses))
        .collect();
    eligible.sort_by(|a, b| dispatch_order(a, b));
    eligible.truncate(limit);
    eligible
}

/// Every non-terminal task that (transitively) depends on `failed`.
///
/// Returned in breadth-first order from the failed task.
pub fn cascade_targets(failed: Uuid, tasks: &[Task]) -> Vec<Uuid> {
    let mut dependents: HashMap<Uuid, Vec<&Task>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents.entry(*dep).or_default().push(task);
        }
    }

    let mut seen = HashSet::from([failed]);
    let mut queue = VecDeque::from([failed]);
    let mut targets = Vec::new();

    while let Some(id) = queue.pop_front() {
        for child in dependents.get(&id).into_iter().flatten() {
            if child.status.is_terminal() || !seen.insert(child.id) {
                continue;
            }
            targets.push(child.id);
            queue.push_back(child.id);
        }
    }
    targets
}

/// Goal status implied by the statuses of its tasks.
///
/// An empty goal stays active.
pub fn settle_goal(statuses: &[TaskStatus]) -> GoalStatus {
    if statuses.is_empty() {
        return GoalStatus::Active;
    }
    if statuses.iter().all(|s| *s == TaskStatus::Completed) {
        GoalStatus::Completed
    } else if statuses.iter().any(|s| s.is_progressable()) {
        GoalStatus::Active
    } else {
        GoalStatus::Failed
    }
}
