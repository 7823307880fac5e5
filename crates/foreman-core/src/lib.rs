//! foreman-core
//!
//! A durable, crash-recoverable local job queue that delegates process
//! execution to an external unit supervisor (systemd) and reconciles queue
//! state against supervisor-reported unit state.
//!
//! Module map:
//! - **domain**: IDs, task spec/record, status state machine
//! - **queue**: the durable store (SQLite), retry policy, dependency graph
//! - **supervisor**: the unit supervisor port and the systemd adapter
//! - **worker**: claim/launch/await/finalize loops, crash recovery
//! - **config**: worker tuning knobs

pub mod config;
pub mod domain;
pub mod error;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use config::WorkerConfig;
pub use domain::{ResourceLimits, SchedulingPolicy, TaskId, TaskRecord, TaskSpec, TaskStatus, WorkerId};
pub use error::QueueError;
pub use queue::{FinalizeOutcome, QueueStore, RetryPolicy, SqliteQueue, StatusCounts, TaskOutcome};
pub use supervisor::{Supervisor, SupervisorError, SystemdSupervisor, UnitName, UnitState};
pub use worker::WorkerGroup;
