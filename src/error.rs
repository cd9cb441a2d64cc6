//! Error types for the orchestrator.

use std::time::Duration;

use uuid::Uuid;

use crate::graph::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Admin error: {0}")]
    Admin(#[from] AdminError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} did not answer within {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::InvalidResponse { .. }
            | Self::ContextLengthExceeded { .. }
            | Self::AuthFailed { .. }
            | Self::Json(_) => false,
        }
    }
}

/// Tool execution errors as seen by the runner.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Execution backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Tool {name} blocked by {guard}: {reason}")]
    Blocked {
        name: String,
        guard: String,
        reason: String,
    },
}

/// Task lifecycle and worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Goal {id} not found")]
    GoalNotFound { id: Uuid },

    #[error("Task {id} is {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: TaskStatus,
        target: TaskStatus,
    },

    #[error("Invalid plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("Worker pool is full ({max} workers)")]
    PoolFull { max: usize },

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Invalid worker address: {0}")]
    InvalidAddress(String),
}

/// Errors from the administrative mutation surface.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {status}; {action} requires one of: {allowed}")]
    IneligibleStatus {
        id: Uuid,
        status: TaskStatus,
        action: &'static str,
        allowed: &'static str,
    },

    #[error("A reason is required for {action}")]
    MissingReason { action: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
