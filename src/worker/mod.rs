//! Worker pool and per-task runners.

mod pool;
mod prompts;
mod runner;

pub use pool::{WorkerHandle, WorkerPool};
pub use runner::{RunOutcome, RunnerDeps, TaskRunner};

pub(crate) use runner::shutdown_signalled;
