//! Kernel error types.

use thiserror::Error;

use crate::source::SourceKey;

/// Why a run failed. `E` is the worker's own error payload.
#[derive(Debug, Error)]
pub enum RunError<E> {
    /// A worker reported failure through its completion.
    #[error("task `{key}` failed: {error}")]
    Worker { key: SourceKey, error: E },

    /// Every handle to a task's completion was dropped without resolving.
    /// Surfaced as a failure so the run can never hang waiting on a signal
    /// that will not come.
    #[error("task `{key}` dropped its completion without resolving")]
    Abandoned { key: SourceKey },
}

impl<E> RunError<E> {
    /// Key of the task that caused the failure.
    pub fn key(&self) -> &SourceKey {
        match self {
            RunError::Worker { key, .. } | RunError::Abandoned { key } => key,
        }
    }

    /// The worker error payload, if any.
    pub fn into_worker_error(self) -> Option<E> {
        match self {
            RunError::Worker { error, .. } => Some(error),
            RunError::Abandoned { .. } => None,
        }
    }
}
