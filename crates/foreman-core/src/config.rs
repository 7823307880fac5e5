//! Worker configuration.

use std::time::Duration;

/// Tuning for the worker loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops (each runs one task at a time).
    pub concurrency: usize,

    /// How long a claim is owned before a dead worker's task is reclaimed.
    /// Must exceed the worst-case execution time of any task; this is a
    /// configuration contract, not a derived value.
    pub lease_timeout: Duration,

    /// Interval between supervisor state queries while awaiting a unit.
    pub poll_interval: Duration,

    /// Upper bound on how long an idle worker parks before re-checking for
    /// eligible work (in-process enqueues wake it earlier).
    pub idle_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lease_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(1),
            idle_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }
}
