//! The `Tool` trait and its output type.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::error::ToolError;

/// Output of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Text fed back to the model as the tool result.
    pub content: String,
    pub duration: Duration,
    /// Set by tools that end the task (`task_done`).
    pub finishes_task: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            duration,
            finishes_task: false,
        }
    }

    pub fn finish(summary: impl Into<String>) -> Self {
        Self {
            content: summary.into(),
            duration: Duration::ZERO,
            finishes_task: true,
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Read a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing string parameter '{key}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_str_reports_missing_key() {
        let params = serde_json::json!({"command": "ls", "timeout_ms": 5});
        assert_eq!(require_str("exec", &params, "command").unwrap(), "ls");
        let err = require_str("exec", &params, "timeout_ms").unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }
}
