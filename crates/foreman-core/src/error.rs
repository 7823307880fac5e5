//! Queue error taxonomy.

use thiserror::Error;

use crate::domain::TaskId;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Enqueue collision on a caller-supplied uniqueness key.
    /// Reported to the caller, never retried internally.
    #[error("a non-terminal task already holds uniqueness key {0:?}")]
    DuplicateKey(String),

    /// A task spec with an empty argument vector is not executable.
    #[error("task command must not be empty")]
    EmptyCommand,

    /// A declared dependency does not exist in the store.
    #[error("dependency task {0} does not exist")]
    DependencyNotFound(TaskId),

    /// Adding the edge would make eligibility unsatisfiable forever.
    #[error("dependency cycle: {0:?}")]
    DependencyCycle(Vec<TaskId>),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// The operation requires the task to be in a different state,
    /// e.g. adding a dependency to a task that already started.
    #[error("task {id} is {found}, expected {expected}")]
    InvalidState {
        id: TaskId,
        found: &'static str,
        expected: &'static str,
    },

    /// A stored row could not be decoded back into a task record.
    #[error("corrupt task row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
