//! Execution context handed to tools and guards.

use uuid::Uuid;

use crate::graph::{Task, WorkerAddress};

/// Who is calling a tool, on behalf of which task.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: Uuid,
    pub goal_id: Uuid,
    pub worker: WorkerAddress,
    pub agent_role: String,
    pub title: String,
}

impl ToolContext {
    pub fn for_task(task: &Task, worker: &WorkerAddress) -> Self {
        Self {
            task_id: task.id,
            goal_id: task.goal_id,
            worker: worker.clone(),
            agent_role: task.agent_role.clone(),
            title: task.title.clone(),
        }
    }
}
