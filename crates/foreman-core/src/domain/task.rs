//! Task model: what callers enqueue and what the store records.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::state::TaskStatus;
use crate::supervisor::UnitName;

/// Real-time scheduling class forwarded to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    Fifo,
    RoundRobin,
}

impl SchedulingPolicy {
    /// Value of the supervisor's `CPUSchedulingPolicy=` property.
    pub fn as_property(self) -> &'static str {
        match self {
            SchedulingPolicy::Fifo => "fifo",
            SchedulingPolicy::RoundRobin => "rr",
        }
    }
}

/// Resource caps and scheduling hints, passed through to the supervisor as
/// unit properties. The queue never interprets these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Nice value (-20..=19).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nice: Option<i32>,

    /// Relative CPU weight (`CPUWeight=`, 1..=10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_weight: Option<u32>,

    /// CPU time ceiling in percent of one core (`CPUQuota=`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota_pct: Option<u32>,

    /// Memory ceiling as a supervisor size string, e.g. "512M" (`MemoryMax=`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<String>,

    /// Real-time scheduling class + priority
    /// (`CPUSchedulingPolicy=`/`CPUSchedulingPriority=`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<(SchedulingPolicy, u32)>,

    /// Hard wall-clock ceiling enforced by the supervisor (`RuntimeMaxSec=`).
    /// Independent of the queue's lease timeout; both are honored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_max: Option<Duration>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a caller hands to `enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Argument vector to execute. Must be non-empty; opaque to the queue.
    pub command: Vec<String>,

    /// Higher runs first among eligible tasks.
    pub priority: i64,

    /// Earliest eligible time. None means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Tasks that must all reach `done` before this one is eligible.
    pub dependencies: Vec<TaskId>,

    /// Total execution budget, including the first attempt.
    pub max_attempts: u32,

    /// Caller-supplied de-duplication key. While a task holding the key is
    /// non-terminal, enqueueing the same key is rejected.
    pub unique_key: Option<String>,

    /// Working directory for the supervised unit.
    pub working_dir: Option<PathBuf>,

    /// Environment passed to the unit.
    pub env: BTreeMap<String, String>,

    pub limits: ResourceLimits,
}

impl TaskSpec {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            priority: 0,
            scheduled_at: None,
            dependencies: Vec::new(),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            unique_key: None,
            working_dir: None,
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Delay the first eligible time relative to now.
    pub fn with_delay(self, delay: Duration) -> Self {
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.with_scheduled_at(at)
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// A task as the store sees it. Single source of truth for task state;
/// all transitions happen through the store's guarded updates.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub command: Vec<String>,
    pub priority: i64,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,

    /// Completed executions so far. Incremented by finalize and by lease
    /// reclamation, never at claim time.
    pub attempts: u32,
    pub max_attempts: u32,

    pub dependencies: Vec<TaskId>,
    pub unique_key: Option<String>,

    /// Set while claimed; cleared on finalize and reclamation.
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Supervisor handle of the unit currently running this task.
    pub unit_name: Option<UnitName>,

    /// Terminal payload.
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,

    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Number of the attempt currently running (or about to run).
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec = TaskSpec::new(vec!["true".into()]);
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.max_attempts, TaskSpec::DEFAULT_MAX_ATTEMPTS);
        assert!(spec.scheduled_at.is_none());
        assert!(spec.dependencies.is_empty());
        assert!(spec.limits.is_empty());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let spec = TaskSpec::new(vec!["true".into()]).with_max_attempts(0);
        assert_eq!(spec.max_attempts, 1);
    }

    #[test]
    fn limits_roundtrip_json() {
        let limits = ResourceLimits {
            nice: Some(5),
            cpu_weight: Some(200),
            cpu_quota_pct: Some(50),
            memory_max: Some("512M".into()),
            scheduling: Some((SchedulingPolicy::Fifo, 90)),
            runtime_max: Some(Duration::from_secs(300)),
        };
        let s = serde_json::to_string(&limits).expect("serialize");
        let de: ResourceLimits = serde_json::from_str(&s).expect("deserialize");
        assert_eq!(de, limits);
    }
}
