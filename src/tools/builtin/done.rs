use async_trait::async_trait;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolOutput, require_str};

/// Ends the task; the summary becomes the task output.
#[derive(Debug, Default)]
pub struct TaskDoneTool;

#[async_trait]
impl Tool for TaskDoneTool {
    fn name(&self) -> &str {
        "task_done"
    }

    fn description(&self) -> &str {
        "Mark the current task as finished. Call this once the work is complete, \
         with a summary of what was produced."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "What was done and where the results are"
                }
            },
            "required": ["summary"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let summary = require_str(self.name(), &params, "summary")?;
        tracing::debug!(task_id = %ctx.task_id, "task_done called");
        Ok(ToolOutput::finish(summary))
    }
}
