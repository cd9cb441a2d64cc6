use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::tools::backend::ExecutionBackend;
use crate::tools::tool::{Tool, ToolOutput, require_str};

/// Shell command execution.
pub struct ExecTool {
    backend: Arc<dyn ExecutionBackend>,
    /// Default and upper bound for `timeout_ms`.
    max_timeout: Duration,
}

impl ExecTool {
    pub fn new(backend: Arc<dyn ExecutionBackend>, max_timeout: Duration) -> Self {
        Self {
            backend,
            max_timeout,
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in the task's working directory. Returns combined \
         stdout/stderr and the exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (optional)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = require_str(self.name(), &params, "command")?;
        let timeout = params
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.max_timeout)
            .min(self.max_timeout);

        let start = Instant::now();
        tracing::debug!(task_id = %ctx.task_id, backend = self.backend.name(), command, "exec");
        let out = self.backend.exec(command, timeout).await?;

        let result = serde_json::json!({
            "output": out.output,
            "exit_code": out.exit_code,
            "success": out.exit_code == 0,
        });
        Ok(ToolOutput::text(result.to_string(), start.elapsed()))
    }
}
