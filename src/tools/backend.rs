//! Execution backends behind the built-in tools.
//!
//! Tools never touch the machine directly; they go through an
//! [`ExecutionBackend`]. The remote sandbox is an external implementation
//! of the same trait. [`FallbackBackend`] tries it first and drops to the
//! local backend when it is unreachable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::ToolError;

/// Result of a command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ToolError>;

    /// Returns the number of bytes written.
    async fn write_file(&self, path: &str, content: &str) -> Result<usize, ToolError>;

    /// Contents truncated to `max_bytes`.
    async fn read_file(&self, path: &str, max_bytes: usize) -> Result<String, ToolError>;
}

/// Remote first, local when the remote reports itself unavailable.
///
/// Only [`ToolError::BackendUnavailable`] triggers the fallback; a command
/// that ran remotely and failed is not re-run locally.
pub struct FallbackBackend {
    remote: Option<Arc<dyn ExecutionBackend>>,
    local: Arc<dyn ExecutionBackend>,
}

impl FallbackBackend {
    pub fn new(remote: Option<Arc<dyn ExecutionBackend>>, local: Arc<dyn ExecutionBackend>) -> Self {
        Self { remote, local }
    }

    fn log_fallback(&self, op: &str, err: &ToolError) {
        warn!(op, error = %err, local = self.local.name(), "Remote backend unavailable, falling back");
    }
}

#[async_trait]
impl ExecutionBackend for FallbackBackend {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ToolError> {
        if let Some(remote) = &self.remote {
            match remote.exec(command, timeout).await {
                Err(err @ ToolError::BackendUnavailable { .. }) => self.log_fallback("exec", &err),
                other => return other,
            }
        }
        self.local.exec(command, timeout).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<usize, ToolError> {
        if let Some(remote) = &self.remote {
            match remote.write_file(path, content).await {
                Err(err @ ToolError::BackendUnavailable { .. }) => {
                    self.log_fallback("write_file", &err)
                }
                other => return other,
            }
        }
        self.local.write_file(path, content).await
    }

    async fn read_file(&self, path: &str, max_bytes: usize) -> Result<String, ToolError> {
        if let Some(remote) = &self.remote {
            match remote.read_file(path, max_bytes).await {
                Err(err @ ToolError::BackendUnavailable { .. }) => {
                    self.log_fallback("read_file", &err)
                }
                other => return other,
            }
        }
        self.local.read_file(path, max_bytes).await
    }
}
