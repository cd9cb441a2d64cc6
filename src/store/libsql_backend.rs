//! libSQL implementation of the async `Database` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared behind an async mutex so a transaction never interleaves with
//! statements issued by another task.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::graph::rules::{self, CompleteDecision, FailureDecision, RecoveryDecision};
use crate::graph::{Goal, GoalStatus, RuntimeKind, Task, TaskResult, TaskStatus, WorkerAddress};
use crate::store::migrations;
use crate::store::traits::{Database, EventKind, LivenessRecord, TaskEvent, TransitionOutcome};

/// Key prefix of the per-task stale-recovery counters in `kv_state`.
const STALE_RECOVERY_PREFIX: &str = "stale_recovery:";

/// libSQL database backend.
pub struct LibSqlBackend {
    _db: LibSqlDatabase,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    async fn begin(conn: &Connection, op: &str) -> Result<Transaction, DatabaseError> {
        conn.transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width so stored timestamps compare as text.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(ts).as_deref())
}

fn parse_uuid(field: &str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field} parse: {e}")))
}

fn parse_decimal(field: &str, s: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{field} parse: {e}")))
}

fn not_found(entity: &str, id: Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

fn counter_key(task_id: Uuid) -> String {
    format!("{STALE_RECOVERY_PREFIX}{task_id}")
}

/// Commit on success, roll back on error.
async fn finish<T>(
    tx: Transaction,
    op: &str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(op, error = %e, "Rollback failed");
            }
            Err(err)
        }
    }
}

const GOAL_COLUMNS: &str =
    "id, title, description, status, deadline, created_at, completed_at, updated_at";

/// Column order matches GOAL_COLUMNS.
fn row_to_goal(row: &libsql::Row) -> Result<Goal, DatabaseError> {
    let get = |i: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("goal.{name}: {e}")))
    };

    let status = get(3, "status")?;
    Ok(Goal {
        id: parse_uuid("goal.id", &get(0, "id")?)?,
        title: get(1, "title")?,
        description: row.get(2).unwrap_or_default(),
        status: status
            .parse::<GoalStatus>()
            .map_err(DatabaseError::Serialization)?,
        deadline: parse_optional_datetime(row.get(4).ok()),
        created_at: parse_datetime(&get(5, "created_at")?),
        completed_at: parse_optional_datetime(row.get(6).ok()),
        updated_at: parse_datetime(&get(7, "updated_at")?),
    })
}

const TASK_COLUMNS: &str = "id, goal_id, title, description, status, assigned_to, runtime_kind, \
     agent_role, priority, dependencies, result, estimated_cost, actual_cost, timeout_secs, \
     retry_count, max_retries, failure_reason, blocked_by, created_at, assigned_at, started_at, \
     completed_at, updated_at";

/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get = |i: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("task.{name}: {e}")))
    };
    let int = |i: i32, name: &str| -> Result<i64, DatabaseError> {
        row.get::<i64>(i)
            .map_err(|e| DatabaseError::Query(format!("task.{name}: {e}")))
    };

    let status = get(4, "status")?
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;
    let runtime_kind = row
        .get::<String>(6)
        .ok()
        .map(|s| s.parse::<RuntimeKind>())
        .transpose()
        .map_err(DatabaseError::Serialization)?;
    let dependencies: Vec<Uuid> = serde_json::from_str(&get(9, "dependencies")?)
        .map_err(|e| DatabaseError::Serialization(format!("task.dependencies: {e}")))?;
    let result = row
        .get::<String>(10)
        .ok()
        .map(|s| serde_json::from_str::<TaskResult>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("task.result: {e}")))?;
    let blocked_by = row
        .get::<String>(17)
        .ok()
        .map(|s| parse_uuid("task.blocked_by", &s))
        .transpose()?;

    Ok(Task {
        id: parse_uuid("task.id", &get(0, "id")?)?,
        goal_id: parse_uuid("task.goal_id", &get(1, "goal_id")?)?,
        title: get(2, "title")?,
        description: row.get(3).unwrap_or_default(),
        status,
        assigned_to: row.get(5).ok(),
        runtime_kind,
        agent_role: get(7, "agent_role")?,
        priority: int(8, "priority")? as i32,
        dependencies,
        result,
        estimated_cost: parse_decimal("task.estimated_cost", &get(11, "estimated_cost")?)?,
        actual_cost: parse_decimal("task.actual_cost", &get(12, "actual_cost")?)?,
        timeout: std::time::Duration::from_secs(int(13, "timeout_secs")?.max(0) as u64),
        retry_count: int(14, "retry_count")?.max(0) as u32,
        max_retries: int(15, "max_retries")?.max(0) as u32,
        failure_reason: row.get(16).ok(),
        blocked_by,
        created_at: parse_datetime(&get(18, "created_at")?),
        assigned_at: parse_optional_datetime(row.get(19).ok()),
        started_at: parse_optional_datetime(row.get(20).ok()),
        completed_at: parse_optional_datetime(row.get(21).ok()),
        updated_at: parse_datetime(&get(22, "updated_at")?),
    })
}

fn row_to_liveness(row: &libsql::Row) -> Result<LivenessRecord, DatabaseError> {
    let address: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("liveness.address: {e}")))?;
    let kind: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("liveness.runtime_kind: {e}")))?;
    let task_id = row
        .get::<String>(2)
        .ok()
        .map(|s| parse_uuid("liveness.task_id", &s))
        .transpose()?;
    let checked: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("liveness.last_checked_at: {e}")))?;
    let created: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("liveness.created_at: {e}")))?;

    Ok(LivenessRecord {
        address,
        runtime_kind: kind.parse().map_err(DatabaseError::Serialization)?,
        task_id,
        last_checked_at: parse_datetime(&checked),
        created_at: parse_datetime(&created),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<TaskEvent, DatabaseError> {
    let get = |i: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("event.{name}: {e}")))
    };

    Ok(TaskEvent {
        id: parse_uuid("event.id", &get(0, "id")?)?,
        task_id: parse_uuid("event.task_id", &get(1, "task_id")?)?,
        goal_id: parse_uuid("event.goal_id", &get(2, "goal_id")?)?,
        worker: row.get(3).ok(),
        kind: get(4, "kind")?
            .parse::<EventKind>()
            .map_err(DatabaseError::Serialization)?,
        message: get(5, "message")?,
        created_at: parse_datetime(&get(6, "created_at")?),
    })
}

// ── Statement helpers (usable inside a transaction) ─────────────────

async fn query_tasks(
    conn: &Connection,
    op: &str,
    filter: &str,
    params: impl IntoParams,
) -> Result<Vec<Task>, DatabaseError> {
    let mut rows = conn
        .query(&format!("SELECT {TASK_COLUMNS} FROM tasks {filter}"), params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

    let mut tasks = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

async fn fetch_task(conn: &Connection, id: Uuid) -> Result<Option<Task>, DatabaseError> {
    let mut tasks = query_tasks(conn, "get_task", "WHERE id = ?1", params![id.to_string()]).await?;
    Ok(tasks.pop())
}

async fn fetch_goal(conn: &Connection, id: Uuid) -> Result<Option<Goal>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_goal: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_goal(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_goal: {e}"))),
    }
}

async fn insert_goal(conn: &Connection, goal: &Goal) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO goals (id, title, description, status, deadline, created_at, completed_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            goal.id.to_string(),
            goal.title.as_str(),
            goal.description.as_str(),
            goal.status.as_str(),
            opt_ts(goal.deadline.as_ref()),
            ts(&goal.created_at),
            opt_ts(goal.completed_at.as_ref()),
            ts(&goal.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_goal: {e}")))?;
    Ok(())
}

async fn insert_task(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let dependencies = serde_json::to_string(&task.dependencies)
        .map_err(|e| DatabaseError::Serialization(format!("task.dependencies: {e}")))?;
    let result = task
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("task.result: {e}")))?;

    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            task.id.to_string(),
            task.goal_id.to_string(),
            task.title.as_str(),
            task.description.as_str(),
            task.status.as_str(),
            opt_text(task.assigned_to.as_deref()),
            opt_text(task.runtime_kind.map(|k| k.as_str())),
            task.agent_role.as_str(),
            task.priority as i64,
            dependencies,
            opt_text(result.as_deref()),
            task.estimated_cost.to_string(),
            task.actual_cost.to_string(),
            task.timeout.as_secs() as i64,
            task.retry_count as i64,
            task.max_retries as i64,
            opt_text(task.failure_reason.as_deref()),
            opt_text(task.blocked_by.map(|id| id.to_string()).as_deref()),
            ts(&task.created_at),
            opt_ts(task.assigned_at.as_ref()),
            opt_ts(task.started_at.as_ref()),
            opt_ts(task.completed_at.as_ref()),
            ts(&task.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
    Ok(())
}

async fn read_counter(conn: &Connection, task_id: Uuid) -> Result<u32, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT value FROM kv_state WHERE key = ?1",
            params![counter_key(task_id)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("read_counter: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let value: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("read_counter: {e}")))?;
            value
                .parse()
                .map_err(|e| DatabaseError::Serialization(format!("stale counter {value}: {e}")))
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("read_counter: {e}"))),
    }
}

async fn write_counter(
    conn: &Connection,
    task_id: Uuid,
    value: u32,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![counter_key(task_id), value.to_string(), ts(now)],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("write_counter: {e}")))?;
    Ok(())
}

/// Back to `pending` for another attempt; assignment and attempt start are cleared.
async fn requeue(
    conn: &Connection,
    task: &mut Task,
    retry_count: u32,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE tasks SET status = 'pending', assigned_to = NULL, runtime_kind = NULL, \
         assigned_at = NULL, started_at = NULL, retry_count = ?1, \
         failure_reason = COALESCE(?2, failure_reason), updated_at = ?3 WHERE id = ?4",
        params![
            retry_count as i64,
            opt_text(reason),
            ts(&now),
            task.id.to_string()
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("requeue: {e}")))?;

    task.status = TaskStatus::Pending;
    task.assigned_to = None;
    task.runtime_kind = None;
    task.assigned_at = None;
    task.started_at = None;
    task.retry_count = retry_count;
    if let Some(reason) = reason {
        task.failure_reason = Some(reason.to_string());
    }
    task.updated_at = now;
    Ok(())
}

/// Permanently fail `task` and block every non-terminal dependent.
/// Returns the ids newly blocked.
async fn fail_with_cascade(
    conn: &Connection,
    task: &mut Task,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, DatabaseError> {
    conn.execute(
        "UPDATE tasks SET status = 'failed', failure_reason = ?1, assigned_to = NULL, \
         runtime_kind = NULL, updated_at = ?2 WHERE id = ?3",
        params![reason, ts(&now), task.id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;

    task.status = TaskStatus::Failed;
    task.failure_reason = Some(reason.to_string());
    task.assigned_to = None;
    task.runtime_kind = None;
    task.updated_at = now;

    let siblings = query_tasks(
        conn,
        "cascade",
        "WHERE goal_id = ?1",
        params![task.goal_id.to_string()],
    )
    .await?;
    let already_blocked: Vec<Uuid> = siblings
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .map(|t| t.id)
        .collect();

    let mut blocked = Vec::new();
    for id in rules::cascade_targets(task.id, &siblings) {
        if already_blocked.contains(&id) {
            continue;
        }
        conn.execute(
            "UPDATE tasks SET status = 'blocked', blocked_by = ?1, assigned_to = NULL, \
             runtime_kind = NULL, updated_at = ?2 WHERE id = ?3",
            params![task.id.to_string(), ts(&now), id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("cascade: {e}")))?;
        blocked.push(id);
    }

    if !blocked.is_empty() {
        debug!(task_id = %task.id, blocked = blocked.len(), "Cascaded failure to dependents");
    }
    Ok(blocked)
}

/// Settle an active goal whose tasks can no longer make progress.
async fn settle_goal(
    conn: &Connection,
    goal_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let Some(goal) = fetch_goal(conn, goal_id).await? else {
        return Ok(());
    };
    if goal.status != GoalStatus::Active {
        return Ok(());
    }

    let statuses: Vec<TaskStatus> = query_tasks(
        conn,
        "settle_goal",
        "WHERE goal_id = ?1",
        params![goal_id.to_string()],
    )
    .await?
    .into_iter()
    .map(|t| t.status)
    .collect();

    let settled = rules::settle_goal(&statuses);
    if settled == GoalStatus::Active {
        return Ok(());
    }

    conn.execute(
        "UPDATE goals SET status = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
        params![settled.as_str(), ts(&now), goal_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("settle_goal: {e}")))?;

    info!(goal_id = %goal_id, status = %settled, "Goal settled");
    Ok(())
}

// ── Transition bodies (run inside a transaction) ────────────────────

async fn complete_in(
    conn: &Connection,
    id: Uuid,
    owner: Option<&WorkerAddress>,
    result: &TaskResult,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let mut task = fetch_task(conn, id).await?.ok_or_else(|| not_found("task", id))?;

    match rules::decide_complete(task.status) {
        CompleteDecision::AlreadyTerminal => return Ok(TransitionOutcome::Unchanged(task)),
        CompleteDecision::Reject => return Ok(TransitionOutcome::Rejected(task)),
        CompleteDecision::Apply => {}
    }
    if owner.is_some_and(|o| !task.is_owned_by(o)) {
        return Ok(TransitionOutcome::NotOwner(task));
    }

    let result_json = serde_json::to_string(result)
        .map_err(|e| DatabaseError::Serialization(format!("task.result: {e}")))?;
    conn.execute(
        "UPDATE tasks SET status = 'completed', result = ?1, actual_cost = ?2, \
         completed_at = ?3, updated_at = ?3 WHERE id = ?4",
        params![
            result_json,
            result.cost.to_string(),
            ts(&now),
            id.to_string()
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;

    task.status = TaskStatus::Completed;
    task.result = Some(result.clone());
    task.actual_cost = result.cost;
    task.completed_at = Some(now);
    task.updated_at = now;

    settle_goal(conn, task.goal_id, now).await?;
    Ok(TransitionOutcome::Applied(task))
}

async fn fail_in(
    conn: &Connection,
    id: Uuid,
    owner: Option<&WorkerAddress>,
    reason: &str,
    retryable: bool,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let mut task = fetch_task(conn, id).await?.ok_or_else(|| not_found("task", id))?;

    let decision = rules::decide_failure(&task, retryable);
    if decision == FailureDecision::AlreadyTerminal {
        return Ok(TransitionOutcome::Unchanged(task));
    }
    if owner.is_some_and(|o| !task.is_owned_by(o)) {
        return Ok(TransitionOutcome::NotOwner(task));
    }

    match decision {
        FailureDecision::Retry { retry_count } => {
            requeue(conn, &mut task, retry_count, Some(reason), now).await?;
            Ok(TransitionOutcome::Requeued(task))
        }
        _ => {
            let blocked = fail_with_cascade(conn, &mut task, reason, now).await?;
            settle_goal(conn, task.goal_id, now).await?;
            Ok(TransitionOutcome::Failed { task, blocked })
        }
    }
}

async fn release_in(
    conn: &Connection,
    id: Uuid,
    owner: Option<&WorkerAddress>,
    reset_recoveries: bool,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let mut task = fetch_task(conn, id).await?.ok_or_else(|| not_found("task", id))?;

    if task.status.is_terminal() {
        return Ok(TransitionOutcome::Unchanged(task));
    }
    if !task.status.is_owned() {
        return Ok(TransitionOutcome::Rejected(task));
    }
    if owner.is_some_and(|o| !task.is_owned_by(o)) {
        return Ok(TransitionOutcome::NotOwner(task));
    }

    let retry_count = task.retry_count;
    requeue(conn, &mut task, retry_count, None, now).await?;

    if reset_recoveries {
        conn.execute(
            "UPDATE tasks SET failure_reason = NULL WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("release_task: {e}")))?;
        conn.execute(
            "DELETE FROM kv_state WHERE key = ?1",
            params![counter_key(id)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("release_task: {e}")))?;
        task.failure_reason = None;
    }

    Ok(TransitionOutcome::Applied(task))
}

async fn recover_in(
    conn: &Connection,
    id: Uuid,
    expected: TaskStatus,
    expected_owner: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let mut task = fetch_task(conn, id).await?.ok_or_else(|| not_found("task", id))?;

    if task.status != expected || task.assigned_to.as_deref() != expected_owner {
        return Ok(TransitionOutcome::Unchanged(task));
    }

    let previous = read_counter(conn, id).await?;
    match rules::decide_recovery(previous, task.max_retries) {
        RecoveryDecision::Requeue { recoveries } => {
            write_counter(conn, id, recoveries, &now).await?;
            let retry_count = task.retry_count.saturating_add(1);
            requeue(conn, &mut task, retry_count, Some(reason), now).await?;
            Ok(TransitionOutcome::Requeued(task))
        }
        RecoveryDecision::Exhausted { recoveries } => {
            write_counter(conn, id, recoveries, &now).await?;
            let reason = format!(
                "{reason} (stale recovery {recoveries}/{} exhausted)",
                task.max_retries
            );
            let blocked = fail_with_cascade(conn, &mut task, &reason, now).await?;
            settle_goal(conn, task.goal_id, now).await?;
            Ok(TransitionOutcome::Failed { task, blocked })
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

const LIVENESS_COLUMNS: &str = "address, runtime_kind, task_id, last_checked_at, created_at";

const EVENT_COLUMNS: &str = "id, task_id, goal_id, worker, kind, message, created_at";

/// Pending task with no dependency that is missing or not completed.
const DEPENDENCIES_COMPLETED: &str = "NOT EXISTS (SELECT 1 FROM json_each(tasks.dependencies) d \
     LEFT JOIN tasks dep ON dep.id = d.value WHERE dep.status IS NOT 'completed')";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Goals ───────────────────────────────────────────────────────

    async fn create_goal(&self, goal: &Goal) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        insert_goal(&conn, goal).await?;
        debug!(goal_id = %goal.id, "Goal created");
        Ok(())
    }

    async fn get_goal(&self, id: Uuid) -> Result<Option<Goal>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_goal(&conn, id).await
    }

    async fn list_goals(&self) -> Result<Vec<Goal>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {GOAL_COLUMNS} FROM goals ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_goals: {e}")))?;

        let mut goals = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_goals: {e}")))?
        {
            goals.push(row_to_goal(&row)?);
        }
        Ok(goals)
    }

    async fn insert_plan(&self, goal: &Goal, tasks: &[Task]) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "insert_plan").await?;
        let result: Result<(), DatabaseError> = async {
            insert_goal(&tx, goal).await?;
            for task in tasks {
                insert_task(&tx, task).await?;
            }
            Ok(())
        }
        .await;
        finish(tx, "insert_plan", result).await?;

        info!(goal_id = %goal.id, tasks = tasks.len(), "Goal plan inserted");
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "create_task").await?;
        let result: Result<(), DatabaseError> = async {
            if fetch_goal(&tx, task.goal_id).await?.is_none() {
                return Err(not_found("goal", task.goal_id));
            }
            for dep in &task.dependencies {
                match fetch_task(&tx, *dep).await? {
                    Some(d) if d.goal_id == task.goal_id => {}
                    Some(_) => {
                        return Err(DatabaseError::Constraint(format!(
                            "dependency {dep} of task {} belongs to another goal",
                            task.id
                        )));
                    }
                    None => {
                        return Err(DatabaseError::Constraint(format!(
                            "dependency {dep} of task {} does not exist",
                            task.id
                        )));
                    }
                }
            }
            insert_task(&tx, task).await
        }
        .await;
        finish(tx, "create_task", result).await?;

        debug!(task_id = %task.id, goal_id = %task.goal_id, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_task(&conn, id).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_tasks(&conn, "list_tasks", "ORDER BY created_at ASC", ()).await
    }

    async fn list_tasks_for_goal(&self, goal_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_tasks(
            &conn,
            "list_tasks_for_goal",
            "WHERE goal_id = ?1 ORDER BY created_at ASC",
            params![goal_id.to_string()],
        )
        .await
    }

    async fn list_tasks_by_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.conn.lock().await;
        query_tasks(
            &conn,
            "list_tasks_by_status",
            &format!("WHERE status IN ({list}) ORDER BY created_at ASC"),
            (),
        )
        .await
    }

    async fn list_dispatchable(&self, limit: usize) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn.lock().await;
        let pending = query_tasks(&conn, "list_dispatchable", "WHERE status = 'pending'", ()).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows = conn
            .query(
                "SELECT DISTINCT dep.id, dep.status FROM tasks p, json_each(p.dependencies) d \
                 JOIN tasks dep ON dep.id = d.value WHERE p.status = 'pending'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatchable deps: {e}")))?;

        let mut statuses = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatchable deps: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_dispatchable deps: {e}")))?;
            let status: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("list_dispatchable deps: {e}")))?;
            statuses.insert(
                parse_uuid("dependency.id", &id)?,
                status.parse::<TaskStatus>().map_err(DatabaseError::Serialization)?,
            );
        }

        Ok(rules::select_dispatchable(&pending, &statuses, limit)
            .into_iter()
            .cloned()
            .collect())
    }

    // ── Transitions ─────────────────────────────────────────────────

    async fn assign_task(
        &self,
        id: Uuid,
        worker: &WorkerAddress,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "assign_task").await?;
        let result: Result<bool, DatabaseError> = async {
            let assigned = tx
                .execute(
                    &format!(
                        "UPDATE tasks SET status = 'assigned', assigned_to = ?1, runtime_kind = ?2, \
                         assigned_at = ?3, blocked_by = NULL, updated_at = ?3 \
                         WHERE id = ?4 AND status = 'pending' AND {DEPENDENCIES_COMPLETED}"
                    ),
                    params![
                        worker.to_string(),
                        worker.kind().as_str(),
                        ts(&now),
                        id.to_string()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("assign_task: {e}")))?;
            if assigned == 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO worker_liveness (address, runtime_kind, task_id, last_checked_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4) \
                 ON CONFLICT(address) DO UPDATE SET task_id = excluded.task_id, \
                 last_checked_at = excluded.last_checked_at",
                params![
                    worker.to_string(),
                    worker.kind().as_str(),
                    id.to_string(),
                    ts(&now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("assign_task liveness: {e}")))?;
            Ok(true)
        }
        .await;
        let assigned = finish(tx, "assign_task", result).await?;

        if assigned {
            debug!(task_id = %id, worker = %worker, "Task assigned");
        }
        Ok(assigned)
    }

    async fn claim_task(
        &self,
        id: Uuid,
        worker: &WorkerAddress,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let claimed = conn
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'assigned' AND assigned_to = ?3",
                params![ts(&now), id.to_string(), worker.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_task: {e}")))?;

        if claimed == 1 {
            conn.execute(
                "UPDATE worker_liveness SET last_checked_at = ?1 WHERE address = ?2",
                params![ts(&now), worker.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_task liveness: {e}")))?;
            debug!(task_id = %id, worker = %worker, "Task claimed");
        }
        Ok(claimed == 1)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        owner: Option<&WorkerAddress>,
        result: &TaskResult,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "complete_task").await?;
        let outcome = complete_in(&tx, id, owner, result, Utc::now()).await;
        finish(tx, "complete_task", outcome).await
    }

    async fn fail_task(
        &self,
        id: Uuid,
        owner: Option<&WorkerAddress>,
        reason: &str,
        retryable: bool,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "fail_task").await?;
        let outcome = fail_in(&tx, id, owner, reason, retryable, Utc::now()).await;
        finish(tx, "fail_task", outcome).await
    }

    async fn release_task(
        &self,
        id: Uuid,
        owner: Option<&WorkerAddress>,
        reset_recoveries: bool,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "release_task").await?;
        let outcome = release_in(&tx, id, owner, reset_recoveries, Utc::now()).await;
        finish(tx, "release_task", outcome).await
    }

    async fn recover_stale_task(
        &self,
        id: Uuid,
        expected: TaskStatus,
        expected_owner: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn, "recover_stale_task").await?;
        let outcome = recover_in(&tx, id, expected, expected_owner, reason, now).await;
        finish(tx, "recover_stale_task", outcome).await
    }

    // ── Liveness ────────────────────────────────────────────────────

    async fn record_liveness(
        &self,
        worker: &WorkerAddress,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO worker_liveness (address, runtime_kind, task_id, last_checked_at, created_at) \
             VALUES (?1, ?2, NULL, ?3, ?3) \
             ON CONFLICT(address) DO UPDATE SET last_checked_at = excluded.last_checked_at",
            params![worker.to_string(), worker.kind().as_str(), ts(&now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_liveness: {e}")))?;
        Ok(())
    }

    async fn list_liveness(&self) -> Result<Vec<LivenessRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {LIVENESS_COLUMNS} FROM worker_liveness ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_liveness: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_liveness: {e}")))?
        {
            records.push(row_to_liveness(&row)?);
        }
        Ok(records)
    }

    async fn prune_liveness(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM worker_liveness WHERE last_checked_at < ?1 AND address NOT IN \
                 (SELECT assigned_to FROM tasks WHERE status IN ('assigned', 'running') \
                  AND assigned_to IS NOT NULL)",
                params![ts(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_liveness: {e}")))?;
        Ok(deleted as usize)
    }

    // ── Stale-recovery counters ─────────────────────────────────────

    async fn stale_recovery_count(&self, task_id: Uuid) -> Result<u32, DatabaseError> {
        let conn = self.conn.lock().await;
        read_counter(&conn, task_id).await
    }

    async fn stale_recovery_counts(&self) -> Result<HashMap<Uuid, u32>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT key, value FROM kv_state WHERE key LIKE ?1",
                params![format!("{STALE_RECOVERY_PREFIX}%")],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stale_recovery_counts: {e}")))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stale_recovery_counts: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("stale_recovery_counts: {e}")))?;
            let value: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("stale_recovery_counts: {e}")))?;

            let Some(id) = key
                .strip_prefix(STALE_RECOVERY_PREFIX)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                warn!(key = %key, "Skipping malformed stale-recovery key");
                continue;
            };
            match value.parse::<u32>() {
                Ok(count) => {
                    counts.insert(id, count);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed stale-recovery counter"),
            }
        }
        Ok(counts)
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn record_event(&self, event: &TaskEvent) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO task_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                event.id.to_string(),
                event.task_id.to_string(),
                event.goal_id.to_string(),
                opt_text(event.worker.as_deref()),
                event.kind.as_str(),
                event.message.as_str(),
                ts(&event.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_event: {e}")))?;
        Ok(())
    }

    async fn list_events_for_task(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TaskEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM task_events WHERE task_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC LIMIT ?2"
                ),
                params![task_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events_for_task: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events_for_task: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn latest_event_per_goal(&self) -> Result<HashMap<Uuid, DateTime<Utc>>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT goal_id, MAX(created_at) FROM task_events GROUP BY goal_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_event_per_goal: {e}")))?;

        let mut latest = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_event_per_goal: {e}")))?
        {
            let goal_id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("latest_event_per_goal: {e}")))?;
            let at: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("latest_event_per_goal: {e}")))?;
            latest.insert(parse_uuid("event.goal_id", &goal_id)?, parse_datetime(&at));
        }
        Ok(latest)
    }
}
