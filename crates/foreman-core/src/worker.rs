//! Worker loops: claim, launch via the supervisor, await the unit,
//! finalize. Also startup crash recovery and the lease reclamation pass.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::domain::{TaskRecord, WorkerId};
use crate::error::QueueError;
use crate::queue::{FinalizeOutcome, QueueStore, TaskOutcome};
use crate::supervisor::{Supervisor, UnitName, UnitState};

/// Worker group handle.
/// - `request_shutdown()` stops the loops taking new claims
/// - `shutdown_and_join()` waits for them to wind down
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Reconcile leftovers from previous process lifetimes, then spawn the
    /// configured number of workers. Recovery runs to completion before any
    /// new claim is accepted.
    pub async fn start(
        store: Arc<dyn QueueStore>,
        supervisor: Arc<dyn Supervisor>,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::new();

        let adopted = recover(store.as_ref(), supervisor.as_ref(), &config).await?;
        for (task, worker_id) in adopted {
            let store = Arc::clone(&store);
            let supervisor = Arc::clone(&supervisor);
            let config = config.clone();
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                let unit = task.unit_name.clone().expect("adopted task has a unit");
                await_and_finalize(
                    store.as_ref(),
                    supervisor.as_ref(),
                    &worker_id,
                    &task,
                    &unit,
                    &config,
                    &mut rx,
                )
                .await;
            }));
        }

        for _ in 0..config.concurrency {
            let store = Arc::clone(&store);
            let supervisor = Arc::clone(&supervisor);
            let config = config.clone();
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(store.as_ref(), supervisor.as_ref(), &config, &mut rx).await;
            }));
        }

        Ok(Self { shutdown_tx, joins })
    }

    /// Request shutdown for all workers. In-flight units keep running under
    /// the supervisor; their tasks are reconciled by lease expiry or the
    /// next startup recovery.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

/// Outcome a terminal unit state maps to. `Active` has no outcome.
fn unit_outcome(state: UnitState) -> Option<TaskOutcome> {
    match state {
        UnitState::Active => None,
        UnitState::Exited { exit_code: 0 } => Some(TaskOutcome::Success { exit_code: 0 }),
        UnitState::Exited { exit_code } => Some(TaskOutcome::Failure {
            error: format!("unit exited with status {exit_code}"),
            exit_code: Some(exit_code),
        }),
        UnitState::Failed { result, exit_code } => Some(TaskOutcome::Failure {
            error: format!("unit failed: {result}"),
            exit_code,
        }),
        // Never a silent success: a vanished unit proves nothing.
        UnitState::Gone => Some(TaskOutcome::failure("unit disappeared from the supervisor")),
    }
}

/// Startup crash recovery: reconcile every task left `running` by a previous
/// process lifetime against supervisor-reported unit state. Still-active
/// units are adopted and returned for awaiting; everything else is finalized
/// (a gone or failed unit counts as a failed attempt, a cleanly exited unit
/// as whatever its exit code says).
async fn recover(
    store: &dyn QueueStore,
    supervisor: &dyn Supervisor,
    config: &WorkerConfig,
) -> Result<Vec<(TaskRecord, WorkerId)>, QueueError> {
    let running = store.running().await?;
    if running.is_empty() {
        return Ok(Vec::new());
    }
    info!(count = running.len(), "recovering tasks left running");

    let mut adopted = Vec::new();
    for mut task in running {
        let Some(owner) = task.lease_owner.clone() else {
            // Running without an owner should not occur; leave it to the
            // lease reclamation pass rather than guessing.
            warn!(task = %task.id, "running task has no lease owner");
            continue;
        };

        match task.unit_name.clone() {
            None => {
                // Claimed but never launched: the worker died in between.
                let outcome =
                    TaskOutcome::failure("worker crashed before a unit launch was recorded");
                store.finalize(task.id, &owner, outcome).await?;
                warn!(task = %task.id, "recovered claim with no unit");
            }
            Some(unit) => match supervisor.poll(&unit).await {
                Ok(UnitState::Active) => {
                    let worker_id = WorkerId::generate();
                    if store.adopt(task.id, &worker_id, config.lease_timeout).await? {
                        info!(task = %task.id, unit = %unit, "adopted still-running unit");
                        task.lease_owner = Some(worker_id.clone());
                        adopted.push((task, worker_id));
                    }
                }
                Ok(state) => {
                    let outcome = unit_outcome(state).expect("state is terminal");
                    store.finalize(task.id, &owner, outcome).await?;
                    let _ = supervisor.cleanup(&unit).await;
                    info!(task = %task.id, unit = %unit, "reconciled finished unit");
                }
                Err(e) => {
                    // Leave the task alone; lease expiry is the backstop.
                    warn!(task = %task.id, unit = %unit, "recovery poll failed: {e}");
                }
            },
        }
    }
    Ok(adopted)
}

async fn worker_loop(
    store: &dyn QueueStore,
    supervisor: &dyn Supervisor,
    config: &WorkerConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let worker_id = WorkerId::generate();
    info!(worker = %worker_id, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Lease reclamation and the unsatisfiable sweep ride on the claim
        // cycle; every worker contributes, the guarded updates keep it safe.
        if let Err(e) = store.reclaim_expired().await {
            warn!(worker = %worker_id, "lease reclamation failed: {e}");
        }
        if let Err(e) = store.fail_unsatisfiable().await {
            warn!(worker = %worker_id, "unsatisfiable sweep failed: {e}");
        }

        let claimed = match store.claim(&worker_id, config.lease_timeout).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(worker = %worker_id, "claim failed: {e}");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(config.idle_interval) => {}
                }
                continue;
            }
        };

        let Some(task) = claimed else {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = store.wait_for_ready(config.idle_interval) => {}
            }
            continue;
        };

        run_one(store, supervisor, &worker_id, &task, config, shutdown_rx).await;
    }

    info!(worker = %worker_id, "worker stopped");
}

/// One claimed task: launch, await, finalize.
async fn run_one(
    store: &dyn QueueStore,
    supervisor: &dyn Supervisor,
    worker_id: &WorkerId,
    task: &TaskRecord,
    config: &WorkerConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    info!(task = %task.id, attempt = task.current_attempt(), "launching");

    let unit = match supervisor.launch(task).await {
        Ok(unit) => unit,
        Err(e) => {
            // A rejected unit is an immediate task failure, consuming one
            // attempt through the normal retry policy.
            warn!(task = %task.id, "launch rejected: {e}");
            let outcome = TaskOutcome::failure(format!("launch rejected: {e}"));
            match store.finalize(task.id, worker_id, outcome).await {
                Ok(result) => debug!(task = %task.id, ?result, "launch rejection finalized"),
                Err(e) => error!(task = %task.id, "finalize failed: {e}"),
            }
            return;
        }
    };

    match store.attach_unit(task.id, worker_id, &unit).await {
        Ok(true) => {}
        Ok(false) => {
            // The lease was reclaimed between claim and launch. The unit is
            // not ours to finalize; stop it and let the new owner decide.
            warn!(task = %task.id, unit = %unit, "lease lost before launch was recorded");
            let _ = supervisor.stop(&unit).await;
            let _ = supervisor.cleanup(&unit).await;
            return;
        }
        Err(e) => {
            error!(task = %task.id, "recording unit handle failed: {e}");
            let _ = supervisor.stop(&unit).await;
            let _ = supervisor.cleanup(&unit).await;
            return;
        }
    }

    await_and_finalize(store, supervisor, worker_id, task, &unit, config, shutdown_rx).await;
}

/// Poll the unit at the configured interval until it reaches a terminal
/// state, then finalize. Shutdown is honored between polls: the unit keeps
/// running under the supervisor and recovery reconciles it later.
async fn await_and_finalize(
    store: &dyn QueueStore,
    supervisor: &dyn Supervisor,
    worker_id: &WorkerId,
    task: &TaskRecord,
    unit: &UnitName,
    config: &WorkerConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let outcome = loop {
        if *shutdown_rx.borrow() {
            info!(task = %task.id, unit = %unit, "shutdown mid-execution; unit left to recovery");
            return;
        }

        match supervisor.poll(unit).await {
            Ok(UnitState::Active) => {}
            Ok(state) => break unit_outcome(state).expect("state is terminal"),
            Err(e) => warn!(task = %task.id, unit = %unit, "poll failed: {e}"),
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    };

    match store.finalize(task.id, worker_id, outcome).await {
        Ok(FinalizeOutcome::Done) => info!(task = %task.id, "done"),
        Ok(FinalizeOutcome::Retried { next_run_at }) => {
            info!(task = %task.id, %next_run_at, "failed; retry scheduled")
        }
        Ok(FinalizeOutcome::Failed) => warn!(task = %task.id, "failed permanently"),
        Ok(FinalizeOutcome::Stale) => {
            // Reclaimed while we were away; the new owner's state stands.
            debug!(task = %task.id, "finalize was stale")
        }
        Err(e) => error!(task = %task.id, "finalize failed: {e}"),
    }

    let _ = supervisor.cleanup(unit).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskSpec, TaskStatus};
    use crate::queue::{RetryPolicy, SqliteQueue};
    use crate::supervisor::SupervisorError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Scripted supervisor: per-unit state sequences, no real systemd.
    #[derive(Default)]
    struct MockSupervisor {
        scripts: Mutex<HashMap<String, VecDeque<UnitState>>>,
        launches: Mutex<Vec<String>>,
        reject_launches: AtomicBool,
    }

    impl MockSupervisor {
        fn script(&self, unit: &str, states: Vec<UnitState>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(unit.to_string(), states.into());
        }

        fn reject_launches(&self) {
            self.reject_launches.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Supervisor for MockSupervisor {
        async fn launch(&self, task: &TaskRecord) -> Result<UnitName, SupervisorError> {
            let unit = UnitName::new(format!("mock-{}-{}", task.id, task.current_attempt()));
            if self.reject_launches.load(Ordering::SeqCst) {
                return Err(SupervisorError::Launch {
                    unit,
                    message: "invalid properties".into(),
                });
            }
            self.launches.lock().unwrap().push(unit.as_str().to_string());
            Ok(unit)
        }

        async fn poll(&self, unit: &UnitName) -> Result<UnitState, SupervisorError> {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(unit.as_str()) {
                Some(states) => {
                    if states.len() > 1 {
                        Ok(states.pop_front().unwrap())
                    } else {
                        Ok(states.front().cloned().unwrap_or(UnitState::Gone))
                    }
                }
                // Unscripted units finish cleanly right away.
                None => Ok(UnitState::Exited { exit_code: 0 }),
            }
        }

        async fn stop(&self, _unit: &UnitName) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn cleanup(&self, _unit: &UnitName) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    async fn open_queue() -> (Arc<SqliteQueue>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
        };
        let queue = SqliteQueue::open(dir.path().join("queue.db"), retry)
            .await
            .expect("open");
        (Arc::new(queue), dir)
    }

    fn fast_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(concurrency)
            .with_lease_timeout(Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(1))
            .with_idle_interval(Duration::from_millis(5))
    }

    async fn wait_for_status(
        store: &dyn QueueStore,
        id: TaskId,
        status: TaskStatus,
    ) -> TaskRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = store.get(id).await.unwrap().expect("task exists");
            if record.status == status {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} stuck in {:?}, wanted {status:?}",
                record.status
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn worker_runs_task_to_done() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());

        let id = queue
            .enqueue(TaskSpec::new(vec!["true".into()]))
            .await
            .unwrap();

        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(1))
            .await
            .unwrap();
        let record = wait_for_status(queue.as_ref(), id, TaskStatus::Done).await;
        group.shutdown_and_join().await;

        assert_eq!(record.attempts, 1);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(supervisor.launches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_unit_retries_then_succeeds() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());

        let id = queue
            .enqueue(TaskSpec::new(vec!["flaky".into()]).with_max_attempts(3))
            .await
            .unwrap();
        // First attempt fails; the relaunched unit (default script) succeeds.
        supervisor.script(
            &format!("mock-{id}-1"),
            vec![UnitState::Failed {
                result: "exit-code".into(),
                exit_code: Some(1),
            }],
        );

        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(1))
            .await
            .unwrap();
        let record = wait_for_status(queue.as_ref(), id, TaskStatus::Done).await;
        group.shutdown_and_join().await;

        assert_eq!(record.attempts, 2);
        assert_eq!(supervisor.launches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn launch_rejection_consumes_attempts_until_failed() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());
        supervisor.reject_launches();

        let id = queue
            .enqueue(TaskSpec::new(vec!["nope".into()]).with_max_attempts(2))
            .await
            .unwrap();

        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(1))
            .await
            .unwrap();
        let record = wait_for_status(queue.as_ref(), id, TaskStatus::Failed).await;
        group.shutdown_and_join().await;

        assert_eq!(record.attempts, 2);
        assert!(record.last_error.as_deref().unwrap().contains("launch rejected"));
    }

    #[tokio::test]
    async fn recovery_fails_gone_units() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());

        // Simulate a worker that claimed, launched, and died. The unit has
        // since vanished from the supervisor.
        let dead = WorkerId::generate();
        let id = queue
            .enqueue(TaskSpec::new(vec!["crashy".into()]).with_max_attempts(3))
            .await
            .unwrap();
        queue.claim(&dead, Duration::from_secs(600)).await.unwrap().unwrap();
        queue
            .attach_unit(id, &dead, &UnitName::new("u1"))
            .await
            .unwrap();
        supervisor.script("u1", vec![UnitState::Gone]);

        // Recovery only: no workers to pick the retry up.
        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(0))
            .await
            .unwrap();
        group.shutdown_and_join().await;

        let record = queue.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.attempts, 1);
        assert!(record.lease_owner.is_none());
    }

    #[tokio::test]
    async fn recovery_reconciles_finished_units_as_success() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());

        let dead = WorkerId::generate();
        let id = queue
            .enqueue(TaskSpec::new(vec!["done-already".into()]))
            .await
            .unwrap();
        queue.claim(&dead, Duration::from_secs(600)).await.unwrap().unwrap();
        queue
            .attach_unit(id, &dead, &UnitName::new("u2"))
            .await
            .unwrap();
        supervisor.script("u2", vec![UnitState::Exited { exit_code: 0 }]);

        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(0))
            .await
            .unwrap();
        group.shutdown_and_join().await;

        let record = queue.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn recovery_adopts_active_units_and_awaits_them() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());

        let dead = WorkerId::generate();
        let id = queue
            .enqueue(TaskSpec::new(vec!["long".into()]))
            .await
            .unwrap();
        queue.claim(&dead, Duration::from_secs(600)).await.unwrap().unwrap();
        queue
            .attach_unit(id, &dead, &UnitName::new("u3"))
            .await
            .unwrap();
        supervisor.script("u3", vec![UnitState::Active, UnitState::Exited { exit_code: 0 }]);

        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(0))
            .await
            .unwrap();
        let record = wait_for_status(queue.as_ref(), id, TaskStatus::Done).await;
        group.shutdown_and_join().await;

        // Adopted, not restarted: the original unit was awaited.
        assert_eq!(record.attempts, 1);
        assert!(supervisor.launches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_fails_claims_that_never_launched() {
        let (queue, _dir) = open_queue().await;
        let supervisor = Arc::new(MockSupervisor::default());

        let dead = WorkerId::generate();
        let id = queue
            .enqueue(TaskSpec::new(vec!["never-started".into()]).with_max_attempts(3))
            .await
            .unwrap();
        queue.claim(&dead, Duration::from_secs(600)).await.unwrap().unwrap();

        let group = WorkerGroup::start(queue.clone(), supervisor.clone(), fast_config(0))
            .await
            .unwrap();
        group.shutdown_and_join().await;

        let record = queue.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.as_deref().unwrap().contains("before a unit launch"));
    }
}
