//! Built-in tools: command execution, file access and task completion.

mod done;
mod exec;
mod file;

pub use done::TaskDoneTool;
pub use exec::ExecTool;
pub use file::{ReadFileTool, WriteFileTool};

use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::tools::ToolRegistry;
use crate::tools::backend::ExecutionBackend;

/// Registry holding the four built-in tools over `backend`.
pub fn default_registry(backend: Arc<dyn ExecutionBackend>, config: &WorkerConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ExecTool::new(backend.clone(), config.tool_timeout)));
    registry.register(Arc::new(ReadFileTool::new(
        backend.clone(),
        config.max_output_bytes,
    )));
    registry.register(Arc::new(WriteFileTool::new(backend)));
    registry.register(Arc::new(TaskDoneTool));
    registry
}
