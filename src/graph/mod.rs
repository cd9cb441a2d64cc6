//! Task graph: goals, tasks, and the rules that move tasks between states.

mod model;
mod plan;
pub mod rules;

pub use model::{
    DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT, Goal, GoalStatus, RuntimeKind, Task, TaskResult,
    TaskStatus, WorkerAddress,
};
pub use plan::{GoalPlan, PlannedTask};
