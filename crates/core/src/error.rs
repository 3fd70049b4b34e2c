//! Error types for the Conductor domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

use crate::task::TaskId;

/// The top-level error type for all Conductor operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Backend errors ---
    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Routing ---
    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    // --- Plan structure ---
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    // --- Task execution ---
    #[error("Task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimedOut { task_id: TaskId, timeout_ms: u64 },

    #[error("Task '{task_id}' was cancelled")]
    TaskCancelled { task_id: TaskId },

    #[error("Task '{task_id}' failed: {source}")]
    TaskFailed {
        task_id: TaskId,
        #[source]
        source: Box<Error>,
    },

    // --- Prompt chains ---
    #[error("Chain step '{step}' rejected by gate: {reason}")]
    GateRejected { step: String, reason: String },

    // --- Cooperative cancellation ---
    #[error("Operation cancelled")]
    Cancelled,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Only rate limiting and backend timeouts are transient. Everything else
    /// (invalid requests, missing tools, plan structure) is surfaced at once.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Completion(e) => e.is_transient(),
            Error::TaskFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether this error is the result of cooperative cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::TaskCancelled { .. })
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors surfaced by a [`CompletionService`](crate::completion::CompletionService).
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("Rate limited by backend{}", retry_hint(.retry_after_ms))]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend error: {0}")]
    ProviderError(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited { .. } | CompletionError::Timeout(_)
        )
    }
}

fn retry_hint(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(", retry after {ms}ms"),
        None => String::new(),
    }
}

/// Errors surfaced by the [`ToolRegistry`](crate::tool::ToolRegistry).
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArgs(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ClassificationError {
    #[error("no routing rule matched and no default profile is configured")]
    NoMatch,

    #[error("routing rule refers to unknown profile '{0}'")]
    UnknownProfile(String),
}

/// Structural problems with a plan, always detected before any task runs.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("plan contains a cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("plan depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: TaskId, dependency: TaskId },

    #[error("plan for goal '{0}' has no tasks")]
    Empty(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_error_displays_correctly() {
        let err = Error::Completion(CompletionError::RateLimited {
            retry_after_ms: Some(1500),
        });
        assert!(err.to_string().contains("Rate limited"));
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::from(CompletionError::Timeout("slow".into())).is_transient());
        assert!(Error::from(CompletionError::RateLimited { retry_after_ms: None }).is_transient());
        assert!(!Error::from(CompletionError::InvalidRequest("bad".into())).is_transient());
        assert!(!Error::from(ToolError::NotFound("calc".into())).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn wrapped_task_failure_keeps_transience() {
        let err = Error::TaskFailed {
            task_id: TaskId::from("a"),
            source: Box::new(CompletionError::Timeout("slow".into()).into()),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn cycle_error_shows_path() {
        let err = PlanError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "plan contains a cycle: a -> b -> a");
    }
}
