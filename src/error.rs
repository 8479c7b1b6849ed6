//! Error types of the orchestration core.

use thiserror::Error;

/// Errors raised while ordering services by their dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle. The path starts and ends with the same id.
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    /// A service depends on an id that is not configured.
    #[error("service `{service}` depends on unknown service `{dependency}`")]
    UnknownDependency { service: String, dependency: String },
}

/// Failures reported by a supervisor through its error event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// The OS refused to create the process.
    #[error("failed to spawn `{service}`: {reason}")]
    Spawn { service: String, reason: String },
    /// Waiting on the process failed.
    #[error("lost track of `{service}`: {reason}")]
    Wait { service: String, reason: String },
    /// The process was still alive after the whole signal ladder.
    #[error("process `{service}` (pid {pid}) did not terminate")]
    Termination { service: String, pid: u32 },
}

/// Errors returned by the orchestrator handle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The orchestrator task has shut down.
    #[error("orchestrator is no longer running")]
    Closed,
}
