//! Declarative goal decomposition.
//!
//! A plan names its tasks by local keys so a JSON file can describe the
//! dependency graph before any ids exist.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::graph::model::{Goal, Task};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalPlan {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Plan-local identifier referenced by `depends_on`.
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
}

impl GoalPlan {
    pub fn from_json(json: &str) -> Result<Self, TaskError> {
        serde_json::from_str(json).map_err(|e| TaskError::InvalidPlan {
            reason: format!("malformed plan: {e}"),
        })
    }

    /// Validate the plan and materialize the goal and its tasks.
    ///
    /// Tasks come back in topological order (dependencies first).
    pub fn build(&self) -> Result<(Goal, Vec<Task>), TaskError> {
        let order = self.topological_order()?;

        let mut goal = Goal::new(&self.title, &self.description);
        if let Some(deadline) = self.deadline {
            goal = goal.with_deadline(deadline);
        }

        let mut ids = HashMap::new();
        let mut tasks = Vec::with_capacity(order.len());
        for index in order {
            let planned = &self.tasks[index];
            let dependencies = planned
                .depends_on
                .iter()
                .filter_map(|key| ids.get(key.as_str()).copied())
                .collect();

            let mut task = Task::new(goal.id, &planned.title)
                .with_description(&planned.description)
                .with_priority(planned.priority)
                .with_dependencies(dependencies);
            if let Some(role) = &planned.role {
                task = task.with_role(role);
            }
            if let Some(secs) = planned.timeout_secs {
                task = task.with_timeout(Duration::from_secs(secs));
            }
            if let Some(max_retries) = planned.max_retries {
                task = task.with_max_retries(max_retries);
            }
            if let Some(cost) = planned.estimated_cost {
                task = task.with_estimated_cost(cost);
            }

            ids.insert(planned.key.as_str(), task.id);
            tasks.push(task);
        }

        Ok((goal, tasks))
    }

    /// Kahn's algorithm over plan indices.
    fn topological_order(&self) -> Result<Vec<usize>, TaskError> {
        let invalid = |reason: String| TaskError::InvalidPlan { reason };

        if self.tasks.is_empty() {
            return Err(invalid("plan has no tasks".to_string()));
        }

        let mut index_of = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.key.trim().is_empty() {
                return Err(invalid(format!("task '{}' has an empty key", task.title)));
            }
            if index_of.insert(task.key.as_str(), i).is_some() {
                return Err(invalid(format!("duplicate task key '{}'", task.key)));
            }
        }

        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if dep == &task.key {
                    return Err(invalid(format!("task '{}' depends on itself", task.key)));
                }
                let &d = index_of.get(dep.as_str()).ok_or_else(|| {
                    invalid(format!("task '{}' depends on unknown key '{dep}'", task.key))
                })?;
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let cyclic: Vec<&str> = (0..self.tasks.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.tasks[i].key.as_str())
                .collect();
            return Err(invalid(format!(
                "dependency cycle among: {}",
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }
}
