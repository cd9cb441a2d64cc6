//! File tools. Paths are relative to the backend's working directory.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::tools::backend::ExecutionBackend;
use crate::tools::tool::{Tool, ToolOutput, require_str};

pub struct ReadFileTool {
    backend: Arc<dyn ExecutionBackend>,
    max_bytes: usize,
}

impl ReadFileTool {
    pub fn new(backend: Arc<dyn ExecutionBackend>, max_bytes: usize) -> Self {
        Self { backend, max_bytes }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the working directory. Large files are truncated."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = require_str(self.name(), &params, "path")?;
        let start = Instant::now();
        let content = self.backend.read_file(path, self.max_bytes).await?;
        Ok(ToolOutput::text(content, start.elapsed()))
    }
}

pub struct WriteFileTool {
    backend: Arc<dyn ExecutionBackend>,
}

impl WriteFileTool {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the working directory, creating parent \
         directories as needed. Overwrites existing files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = require_str(self.name(), &params, "path")?;
        let content = require_str(self.name(), &params, "content")?;
        let start = Instant::now();
        let written = self.backend.write_file(path, content).await?;

        let result = serde_json::json!({
            "path": path,
            "bytes_written": written,
        });
        Ok(ToolOutput::text(result.to_string(), start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Task, WorkerAddress};
    use crate::tools::local::LocalBackend;

    fn ctx() -> ToolContext {
        let task = Task::new(uuid::Uuid::new_v4(), "t");
        ToolContext::for_task(&task, &WorkerAddress::local())
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn ExecutionBackend> = Arc::new(LocalBackend::new(dir.path(), 4096));
        let write = WriteFileTool::new(backend.clone());
        let read = ReadFileTool::new(backend, 4);

        let out = write
            .execute(
                serde_json::json!({"path": "out/report.md", "content": "hello world"}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(out.content.contains("\"bytes_written\":11"));

        let out = read
            .execute(serde_json::json!({"path": "out/report.md"}), &ctx())
            .await
            .unwrap();
        assert!(out.content.starts_with("hell"));
        assert!(out.content.contains("truncated 7 bytes"));
    }
}
