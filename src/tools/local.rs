//! Local execution backend: subprocesses and files under one root directory.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::ToolError;
use crate::tools::backend::{ExecOutput, ExecutionBackend};

/// Maximum file size accepted by `write_file` (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Normalize a path by resolving `.` and `..` lexically (no filesystem access).
///
/// `canonicalize` only works on paths that exist, so new files need this.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Truncate to at most `max` bytes on a char boundary, keeping head and tail.
pub(crate) fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let half = max / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        s.len() - max,
        &s[tail_start..]
    )
}

/// Largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Runs commands with `sh -c` and confines file access to `root`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    max_output: usize,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, max_output: usize) -> Self {
        Self {
            root: root.into(),
            max_output,
        }
    }

    fn failed(name: &str, reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Resolve `path` under the root, rejecting anything that escapes it.
    fn resolve(&self, tool: &str, path: &str) -> Result<PathBuf, ToolError> {
        let root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| normalize_lexical(&self.root));
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };
        let resolved = normalize_lexical(&joined);

        if !resolved.starts_with(&root) {
            return Err(ToolError::InvalidParameters {
                name: tool.to_string(),
                reason: format!("path escapes the working directory: {path}"),
            });
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ToolError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::failed("exec", format!("working directory: {e}")))?;

        let mut child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::failed("exec", format!("failed to spawn command: {e}")))?;

        let max = self.max_output;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let limit = max as u64 * 2;
        let result = tokio::time::timeout(timeout, async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            // Drain both pipes together so a full stderr can't stall the child.
            let read_out = async {
                match stdout.as_mut() {
                    Some(pipe) => pipe.take(limit).read_to_end(&mut out).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let read_err = async {
                match stderr.as_mut() {
                    Some(pipe) => pipe.take(limit).read_to_end(&mut err).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let (r1, r2) = tokio::join!(read_out, read_err);
            r1?;
            r2?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((out, err, status.code().unwrap_or(-1)))
        })
        .await;

        match result {
            Ok(Ok((out, err, exit_code))) => {
                let stdout = String::from_utf8_lossy(&out);
                let stderr = String::from_utf8_lossy(&err);
                let output = if stderr.is_empty() {
                    stdout.into_owned()
                } else if stdout.is_empty() {
                    stderr.into_owned()
                } else {
                    format!("{stdout}\n\n--- stderr ---\n{stderr}")
                };
                Ok(ExecOutput {
                    output: truncate_output(&output, max),
                    exit_code,
                })
            }
            Ok(Err(e)) => Err(Self::failed("exec", format!("command execution failed: {e}"))),
            Err(_) => Err(ToolError::Timeout {
                name: "exec".to_string(),
                timeout,
            }),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<usize, ToolError> {
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters {
                name: "write_file".to_string(),
                reason: format!("content exceeds {MAX_WRITE_SIZE} bytes"),
            });
        }
        let resolved = self.resolve("write_file", path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::failed("write_file", format!("{}: {e}", parent.display())))?;
        }
        fs::write(&resolved, content)
            .await
            .map_err(|e| Self::failed("write_file", format!("{}: {e}", resolved.display())))?;
        Ok(content.len())
    }

    async fn read_file(&self, path: &str, max_bytes: usize) -> Result<String, ToolError> {
        let resolved = self.resolve("read_file", path)?;
        let bytes = fs::read(&resolved)
            .await
            .map_err(|e| Self::failed("read_file", format!("{}: {e}", resolved.display())))?;
        let text = String::from_utf8_lossy(&bytes);
        if text.len() <= max_bytes {
            return Ok(text.into_owned());
        }
        let end = floor_char_boundary(&text, max_bytes);
        Ok(format!(
            "{}\n\n... [truncated {} bytes]",
            &text[..end],
            text.len() - end
        ))
    }
}
