//! Goal and task data model.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Default per-task execution timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
    Failed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GoalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown goal status: {other}")),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies and capacity.
    Pending,
    /// Handed to a worker that has not started executing yet.
    Assigned,
    /// Claimed by its worker and executing.
    Running,
    Completed,
    Failed,
    /// A dependency failed permanently.
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Assigned,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Blocked,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Held by a worker (assigned or running).
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Still able to make progress without intervention.
    pub fn is_progressable(&self) -> bool {
        matches!(self, Self::Pending | Self::Assigned | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// Where a worker executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// In-process tokio task.
    Local,
    /// Remote sandbox VM.
    Sandbox,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sandbox => "sandbox",
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            Self::Local => "local://",
            Self::Sandbox => "sandbox://",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "sandbox" => Ok(Self::Sandbox),
            other => Err(format!("unknown runtime kind: {other}")),
        }
    }
}

/// Opaque worker address with its runtime kind made explicit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerAddress {
    kind: RuntimeKind,
    id: String,
}

impl WorkerAddress {
    /// Fresh address for an in-process worker.
    pub fn local() -> Self {
        Self {
            kind: RuntimeKind::Local,
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Address of a remote sandbox worker.
    pub fn sandbox(id: impl Into<String>) -> Self {
        Self {
            kind: RuntimeKind::Sandbox,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parse a stored address (`local://<id>` or `sandbox://<id>`).
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        [RuntimeKind::Local, RuntimeKind::Sandbox]
            .into_iter()
            .find_map(|kind| {
                s.strip_prefix(kind.scheme())
                    .filter(|id| !id.is_empty())
                    .map(|id| Self {
                        kind,
                        id: id.to_string(),
                    })
            })
            .ok_or_else(|| TaskError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.scheme(), self.id)
    }
}

/// Outcome recorded when a task finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub cost: Decimal,
}

impl TaskResult {
    pub fn success(output: impl Into<String>, cost: Decimal) -> Self {
        Self {
            success: true,
            output: output.into(),
            cost,
        }
    }
}

/// A unit of intent owning a set of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: GoalStatus::Active,
            deadline: None,
            created_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The atomic unit of dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Address of the owning worker while assigned or running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_kind: Option<RuntimeKind>,
    pub agent_role: String,
    /// Higher runs first.
    pub priority: i32,
    pub dependencies: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub estimated_cost: Decimal,
    pub actual_cost: Decimal,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Root failed task when this task was blocked by a cascade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal_id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            assigned_to: None,
            runtime_kind: None,
            agent_role: "generalist".to_string(),
            priority: 0,
            dependencies: Vec::new(),
            result: None,
            estimated_cost: Decimal::ZERO,
            actual_cost: Decimal::ZERO,
            timeout: DEFAULT_TASK_TIMEOUT,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            failure_reason: None,
            blocked_by: None,
            created_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = role.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_estimated_cost(mut self, cost: Decimal) -> Self {
        self.estimated_cost = cost;
        self
    }

    /// Whether `address` currently owns this task.
    pub fn is_owned_by(&self, address: &WorkerAddress) -> bool {
        self.status.is_owned() && self.assigned_to.as_deref() == Some(address.to_string().as_str())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_serde_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn worker_address_parse() {
        let local = WorkerAddress::local();
        let parsed = WorkerAddress::parse(&local.to_string()).unwrap();
        assert_eq!(parsed, local);
        assert_eq!(parsed.kind(), RuntimeKind::Local);

        let remote = WorkerAddress::parse("sandbox://vm-42").unwrap();
        assert_eq!(remote.kind(), RuntimeKind::Sandbox);
        assert_eq!(remote.id(), "vm-42");

        assert!(WorkerAddress::parse("local://").is_err());
        assert!(WorkerAddress::parse("http://x").is_err());
    }

    #[test]
    fn task_builder_defaults() {
        let goal = Goal::new("Ship", "Ship the thing");
        let task = Task::new(goal.id, "Write code")
            .with_priority(5)
            .with_max_retries(1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 1);
        assert!(task.started_at.is_none());
        assert!(task.assigned_to.is_none());
    }

    #[test]
    fn ownership_requires_owned_status() {
        let address = WorkerAddress::local();
        let mut task = Task::new(Uuid::new_v4(), "t");
        task.assigned_to = Some(address.to_string());
        assert!(!task.is_owned_by(&address));
        task.status = TaskStatus::Running;
        assert!(task.is_owned_by(&address));
        assert!(!task.is_owned_by(&WorkerAddress::local()));
    }
}
