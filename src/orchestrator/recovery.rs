//! Stale recovery, startup orphan recovery and the cycle flag.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::DatabaseError;
use crate::graph::{RuntimeKind, Task, TaskStatus, WorkerAddress, rules};
use crate::store::{Database, EventKind, TaskEvent, TransitionOutcome};
use crate::worker::WorkerPool;

/// Tasks touched by one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Assigned and running tasks whose worker has gone quiet for too long.
/// A missing liveness record counts as quiet.
pub(crate) async fn recover_stale(
    store: &dyn Database,
    pool: &WorkerPool,
    config: &OrchestratorConfig,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, DatabaseError> {
    let owned = store
        .list_tasks_by_status(&[TaskStatus::Assigned, TaskStatus::Running])
        .await?;
    if owned.is_empty() {
        return Ok(RecoveryReport::default());
    }

    let last_seen: HashMap<String, DateTime<Utc>> = store
        .list_liveness()
        .await?
        .into_iter()
        .map(|record| (record.address, record.last_checked_at))
        .collect();

    let mut report = RecoveryReport::default();
    for task in owned {
        let threshold = match task.status {
            TaskStatus::Assigned => config.assign_timeout,
            _ => config.stale_threshold,
        };
        let seen = task.assigned_to.as_ref().and_then(|a| last_seen.get(a));
        let reason = match seen {
            None => format!("no liveness record while {}", task.status),
            Some(at) => {
                let silence = (now - *at).to_std().unwrap_or_default();
                if silence <= threshold {
                    continue;
                }
                format!(
                    "worker silent for {}s while {} (limit {}s)",
                    silence.as_secs(),
                    task.status,
                    threshold.as_secs()
                )
            }
        };
        recover_one(store, pool, &task, &reason, now, &mut report).await?;
    }

    if report.total() > 0 {
        info!(requeued = report.requeued, failed = report.failed, "Stale tasks recovered");
    }
    Ok(report)
}

/// Tasks left assigned or running by in-process workers of a previous run.
pub(crate) async fn recover_orphans(
    store: &dyn Database,
    pool: &WorkerPool,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, DatabaseError> {
    let owned = store
        .list_tasks_by_status(&[TaskStatus::Assigned, TaskStatus::Running])
        .await?;

    let mut report = RecoveryReport::default();
    for task in owned {
        let Some(owner) = task.assigned_to.as_deref() else {
            continue;
        };
        let is_local = WorkerAddress::parse(owner).is_ok_and(|a| a.kind() == RuntimeKind::Local);
        if !is_local || pool.is_alive(owner).await {
            continue;
        }
        recover_one(store, pool, &task, "orphaned by process restart", now, &mut report).await?;
    }

    if report.total() > 0 {
        info!(requeued = report.requeued, failed = report.failed, "Orphaned tasks recovered at startup");
    }
    Ok(report)
}

async fn recover_one(
    store: &dyn Database,
    pool: &WorkerPool,
    task: &Task,
    reason: &str,
    now: DateTime<Utc>,
    report: &mut RecoveryReport,
) -> Result<(), DatabaseError> {
    let outcome = store
        .recover_stale_task(task.id, task.status, task.assigned_to.as_deref(), reason, now)
        .await?;

    let message = match &outcome {
        TransitionOutcome::Requeued(updated) => {
            report.requeued += 1;
            warn!(
                task_id = %task.id,
                worker = task.assigned_to.as_deref().unwrap_or("-"),
                retry_count = updated.retry_count,
                reason,
                "Stale task requeued"
            );
            format!("requeued: {reason}")
        }
        TransitionOutcome::Failed { task: updated, blocked } => {
            report.failed += 1;
            warn!(
                task_id = %task.id,
                blocked = blocked.len(),
                reason = updated.failure_reason.as_deref().unwrap_or(reason),
                "Stale task failed permanently"
            );
            format!("failed: {}", updated.failure_reason.as_deref().unwrap_or(reason))
        }
        _ => {
            debug!(task_id = %task.id, "Task moved on before recovery, skipping");
            return Ok(());
        }
    };

    if let Some(owner) = task.assigned_to.as_deref() {
        pool.abort(owner, task.id).await;
    }

    let event = TaskEvent::new(task, EventKind::StaleRecovered, message);
    if let Err(e) = store.record_event(&event).await {
        warn!(task_id = %task.id, error = %e, "Failed to record recovery event");
    }
    Ok(())
}

/// Any non-terminal task recovered at least `threshold` times without
/// exhausting its budget.
pub(crate) async fn detect_cycle(
    store: &dyn Database,
    threshold: u32,
) -> Result<bool, DatabaseError> {
    let counts = store.stale_recovery_counts().await?;
    let mut suspects = Vec::new();
    for (task_id, recoveries) in counts {
        if recoveries < threshold {
            continue;
        }
        if let Some(task) = store.get_task(task_id).await?
            && rules::is_cycle_suspect(recoveries, threshold, &task)
        {
            suspects.push(task_id);
        }
    }

    if !suspects.is_empty() {
        warn!(tasks = ?suspects, threshold, "Repeated stale recovery: possible dispatch cycle");
    }
    Ok(!suspects.is_empty())
}
