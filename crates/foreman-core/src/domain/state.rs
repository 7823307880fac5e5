//! Task state machine for the queue.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Queued -> Running -> Done
/// - Queued -> Running -> Queued (retry with backoff, until max_attempts)
/// - Queued -> Running -> Failed (attempts exhausted)
/// - Queued -> Failed (a dependency failed permanently)
///
/// A retry-scheduled task is just `Queued` with a future `scheduled_at`;
/// the claim query never sees it before it is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Eligible for claim once due and dependency-satisfied.
    Queued,

    /// Claimed by a worker; a supervised unit may be attached.
    Running,

    /// Completed successfully. Terminal.
    Done,

    /// Failed permanently (attempts exhausted or unsatisfiable). Terminal.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Is this task claimable (subject to due time and dependencies)?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskStatus::Queued)
    }

    /// Column value for the store.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse a column value back. Returns None for unknown text.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}
