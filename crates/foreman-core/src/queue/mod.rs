//! Queue store: the durable task table and its atomic operations.
//!
//! Design intent:
//! - The store owns all state transitions (claim, finalize, reclaim);
//!   workers execute side effects and report results back.
//! - Every mutation is a bounded, guarded statement; the store never holds
//!   a lock across an await of external work.

mod dependency;
mod retry;
mod sqlite;
mod status;

pub use dependency::DependencyGraph;
pub use retry::RetryPolicy;
pub use sqlite::SqliteQueue;
pub use status::StatusCounts;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{TaskId, TaskRecord, TaskSpec, TaskStatus, WorkerId};
use crate::error::QueueError;
use crate::supervisor::UnitName;

/// Result of one supervised execution, as reported by a worker.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success {
        exit_code: i32,
    },
    Failure {
        error: String,
        exit_code: Option<i32>,
    },
}

impl TaskOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
            exit_code: None,
        }
    }
}

/// What finalize decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Task reached `done`.
    Done,

    /// Failure consumed an attempt; requeued with backoff.
    Retried { next_run_at: DateTime<Utc> },

    /// Attempts exhausted; task is permanently `failed`.
    Failed,

    /// The caller no longer owns the lease. Nothing was changed.
    Stale,
}

/// Queue store port.
///
/// `SqliteQueue` is the durable implementation; the trait is the seam for
/// tests and for swapping the storage engine later.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new task. Fails with `DuplicateKey` when the spec's
    /// uniqueness key is already held by a non-terminal task, and with
    /// `DependencyNotFound` when a declared dependency does not exist.
    /// The task is visible to claimers as soon as this returns.
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError>;

    /// Add a dependency edge between existing tasks. The dependent must
    /// still be `queued`; edges that would close a cycle are rejected.
    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), QueueError>;

    /// Atomically claim the best eligible task: highest priority, then
    /// earliest `scheduled_at`, among tasks that are `queued`, due, and
    /// whose dependencies are all `done`. The claimed task transitions to
    /// `running` with a lease owned by `worker`. Exactly one concurrent
    /// caller wins any given task.
    async fn claim(
        &self,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<Option<TaskRecord>, QueueError>;

    /// Record the supervisor handle for a claimed task. Returns false if
    /// the lease is no longer owned by `worker` (nothing is changed).
    async fn attach_unit(
        &self,
        task: TaskId,
        worker: &WorkerId,
        unit: &UnitName,
    ) -> Result<bool, QueueError>;

    /// Finalize a claimed task. Only the lease owner is accepted; a stale
    /// caller gets `FinalizeOutcome::Stale` and changes nothing. On failure
    /// the retry policy decides between requeue-with-backoff and terminal
    /// `failed`.
    async fn finalize(
        &self,
        task: TaskId,
        worker: &WorkerId,
        outcome: TaskOutcome,
    ) -> Result<FinalizeOutcome, QueueError>;

    /// Lease manager pass: every `running` task whose lease expired is
    /// treated exactly as a failed execution (consumes an attempt).
    /// Returns the reclaimed task ids.
    async fn reclaim_expired(&self) -> Result<Vec<TaskId>, QueueError>;

    /// Fail queued tasks that can never become eligible because a
    /// dependency failed permanently. Returns the affected task ids.
    async fn fail_unsatisfiable(&self) -> Result<Vec<TaskId>, QueueError>;

    /// Take over the lease of a `running` task from a previous process
    /// lifetime (startup crash recovery). Returns false if the task is no
    /// longer running.
    async fn adopt(
        &self,
        task: TaskId,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<bool, QueueError>;

    /// All tasks currently `running` (crash recovery and reconciliation).
    async fn running(&self) -> Result<Vec<TaskRecord>, QueueError>;

    async fn get(&self, task: TaskId) -> Result<Option<TaskRecord>, QueueError>;

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<TaskRecord>, QueueError>;

    /// Counts by status.
    async fn stats(&self) -> Result<StatusCounts, QueueError>;

    /// Delete terminal tasks whose last update is older than the retention
    /// window. Non-terminal tasks are never destroyed.
    async fn prune(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Park until new work may be available, or until `max_wait` elapses.
    /// The default implementation is a plain bounded sleep; implementations
    /// with an in-process wake-up signal can return earlier.
    async fn wait_for_ready(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}
