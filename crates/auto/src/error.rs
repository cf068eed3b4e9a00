//! Scheduler error types.

use thiserror::Error;

/// Structural problem with a task graph, reported synchronously before any
/// task executes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task `{0}` was added more than once")]
    DuplicateTask(String),

    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle among tasks: {0:?}")]
    Cycle(Vec<String>),
}

/// Why a graph execution stopped early. `E` is the task's own error
/// payload.
#[derive(Debug, Error)]
pub enum AutoFailure<E> {
    /// A task reported failure; not-yet-started tasks were not scheduled.
    #[error("task `{task}` failed: {error}")]
    Task { task: String, error: E },

    /// A task dropped its completion without resolving.
    #[error("task `{task}` never resolved its completion")]
    Abandoned { task: String },
}

impl<E> AutoFailure<E> {
    /// Name of the task that caused the failure.
    pub fn task(&self) -> &str {
        match self {
            AutoFailure::Task { task, .. } | AutoFailure::Abandoned { task } => task,
        }
    }
}
