//! Tool surface exposed to runners.

pub mod backend;
pub mod builtin;
pub mod local;
pub mod registry;
pub mod tool;

pub use backend::{ExecOutput, ExecutionBackend, FallbackBackend};
pub use local::LocalBackend;
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolOutput, require_str};
