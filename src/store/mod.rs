//! Persistence layer: libSQL-backed storage for goals, tasks, worker liveness
//! and task events.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, EventKind, LivenessRecord, TaskEvent, TransitionOutcome};
