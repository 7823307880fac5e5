//! Supervisor port: hand a task to an external unit supervisor and read
//! unit state back.
//!
//! Design intent:
//! - The supervisor owns the process lifecycle end to end: output capture,
//!   resource enforcement, signal delivery, and reaping. This process never
//!   waits on a child and never inspects OS process tables; unit state as
//!   reported by the supervisor is the only truth.

mod systemd;

pub use systemd::SystemdSupervisor;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TaskRecord;

/// Handle of one supervised execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitName(String);

impl UnitName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Supervisor-reported state of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    /// Still running (or starting / stopping).
    Active,

    /// Main process exited; the exit code tells success from failure.
    Exited { exit_code: i32 },

    /// The supervisor marked the unit failed (non-zero exit, timeout, kill).
    Failed {
        result: String,
        exit_code: Option<i32>,
    },

    /// The supervisor no longer knows the unit. Never treated as success:
    /// a vanished unit gives no evidence the command completed.
    Gone,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitState::Active)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor rejected the unit request. Surfaced as an immediate
    /// task failure, consuming one attempt.
    #[error("supervisor rejected unit {unit}: {message}")]
    Launch { unit: UnitName, message: String },

    /// A state query could not be completed or parsed.
    #[error("unit {unit}: {message}")]
    Query { unit: UnitName, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Supervisor port. `SystemdSupervisor` drives the real service manager;
/// tests substitute a scripted implementation.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start a unit for the task's current attempt. The unit name is a
    /// deterministic function of (task id, attempt number), so retries
    /// never collide with the remains of a failed prior attempt.
    async fn launch(&self, task: &TaskRecord) -> Result<UnitName, SupervisorError>;

    /// Query supervisor-reported unit state.
    async fn poll(&self, unit: &UnitName) -> Result<UnitState, SupervisorError>;

    /// Request graceful termination. The supervisor owns escalation.
    async fn stop(&self, unit: &UnitName) -> Result<(), SupervisorError>;

    /// Release a unit whose terminal state has been recorded. Best-effort.
    async fn cleanup(&self, unit: &UnitName) -> Result<(), SupervisorError>;
}
