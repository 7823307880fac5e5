//! SQLite-backed queue store.
//!
//! One pool per process; every mutation is a single guarded statement or a
//! short transaction, and all values are bound parameters. Claim atomicity
//! rides on SQLite's single-writer serialization: the
//! `UPDATE ... WHERE id = (SELECT ...) RETURNING *` statement either moves a
//! row to `running` or observes that another claimer already did, so a lost
//! race is invisible to callers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{DependencyGraph, FinalizeOutcome, QueueStore, RetryPolicy, StatusCounts, TaskOutcome};
use crate::domain::{TaskId, TaskRecord, TaskSpec, TaskStatus, WorkerId};
use crate::error::QueueError;
use crate::supervisor::UnitName;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'queued',
        scheduled_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        unique_key TEXT,
        lease_owner TEXT,
        lease_expires_at INTEGER,
        unit_name TEXT,
        exit_code INTEGER,
        last_error TEXT,
        working_dir TEXT,
        env TEXT NOT NULL DEFAULT '{}',
        limits TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    // A finished task's key may be reused; only live tasks hold it.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_unique_key
        ON tasks(unique_key)
        WHERE unique_key IS NOT NULL AND status IN ('queued', 'running')",
    // Serves "best eligible task" lookups.
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim
        ON tasks(status, scheduled_at, priority DESC, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_lease
        ON tasks(status, lease_expires_at)",
    "CREATE TABLE IF NOT EXISTS task_deps (
        task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        depends_on_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        PRIMARY KEY (task_id, depends_on_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_deps_parent ON task_deps(depends_on_id)",
];

/// Eligibility condition shared by the claim statement: queued, due, and no
/// edge to a dependency that is not `done`.
const ELIGIBLE: &str = "t.status = 'queued'
    AND t.scheduled_at <= ?1
    AND NOT EXISTS (
        SELECT 1 FROM task_deps d
        JOIN tasks p ON p.id = d.depends_on_id
        WHERE d.task_id = t.id AND p.status <> 'done'
    )";

pub struct SqliteQueue {
    pool: SqlitePool,
    retry: RetryPolicy,
    notify: Arc<Notify>,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let queue = Self {
            pool,
            retry,
            notify: Arc::new(Notify::new()),
        };
        queue.init_schema().await?;
        Ok(queue)
    }

    async fn init_schema(&self) -> Result<(), QueueError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn load_dependencies(&self, task: TaskId) -> Result<Vec<TaskId>, QueueError> {
        let rows = sqlx::query(
            "SELECT depends_on_id FROM task_deps WHERE task_id = ?1 ORDER BY depends_on_id",
        )
        .bind(task.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| TaskId::new(r.get::<i64, _>("depends_on_id")))
            .collect())
    }

    async fn record_with_deps(&self, row: &SqliteRow) -> Result<TaskRecord, QueueError> {
        let mut record = record_from_row(row)?;
        record.dependencies = self.load_dependencies(record.id).await?;
        Ok(record)
    }

    /// Requeue-or-fail decision shared by finalize and lease reclamation.
    /// Returns (new status, scheduled_at override).
    fn after_failure(&self, new_attempts: u32, max_attempts: u32) -> (TaskStatus, Option<i64>) {
        if self.retry.is_exhausted(new_attempts, max_attempts) {
            (TaskStatus::Failed, None)
        } else {
            let delay = self.retry.next_delay(new_attempts);
            let next = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            (TaskStatus::Queued, Some(next.timestamp_millis()))
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn datetime_from_ms(ms: i64, column: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Corrupt(format!("{column}: invalid timestamp {ms}")))
}

fn record_from_row(row: &SqliteRow) -> Result<TaskRecord, QueueError> {
    let id = TaskId::new(row.get::<i64, _>("id"));
    let status_text: String = row.get("status");
    let status = TaskStatus::parse(&status_text)
        .ok_or_else(|| QueueError::Corrupt(format!("task {id}: unknown status {status_text:?}")))?;

    let command: Vec<String> = serde_json::from_str(row.get::<&str, _>("command"))
        .map_err(|e| QueueError::Corrupt(format!("task {id}: command: {e}")))?;
    let env = serde_json::from_str(row.get::<&str, _>("env"))
        .map_err(|e| QueueError::Corrupt(format!("task {id}: env: {e}")))?;
    let limits = serde_json::from_str(row.get::<&str, _>("limits"))
        .map_err(|e| QueueError::Corrupt(format!("task {id}: limits: {e}")))?;

    let lease_expires_at = row
        .get::<Option<i64>, _>("lease_expires_at")
        .map(|ms| datetime_from_ms(ms, "lease_expires_at"))
        .transpose()?;

    Ok(TaskRecord {
        id,
        command,
        priority: row.get("priority"),
        status,
        scheduled_at: datetime_from_ms(row.get("scheduled_at"), "scheduled_at")?,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        dependencies: Vec::new(),
        unique_key: row.get("unique_key"),
        lease_owner: row
            .get::<Option<String>, _>("lease_owner")
            .map(WorkerId::new),
        lease_expires_at,
        unit_name: row.get::<Option<String>, _>("unit_name").map(UnitName::new),
        exit_code: row.get::<Option<i32>, _>("exit_code"),
        last_error: row.get("last_error"),
        working_dir: row.get::<Option<String>, _>("working_dir").map(Into::into),
        env,
        limits,
        created_at: datetime_from_ms(row.get("created_at"), "created_at")?,
        updated_at: datetime_from_ms(row.get("updated_at"), "updated_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

#[async_trait]
impl QueueStore for SqliteQueue {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        if spec.command.is_empty() {
            return Err(QueueError::EmptyCommand);
        }

        let now = now_ms();
        let scheduled_at = spec.scheduled_at.map(|t| t.timestamp_millis()).unwrap_or(now);
        let command = serde_json::to_string(&spec.command)
            .map_err(|e| QueueError::Corrupt(e.to_string()))?;
        let env = serde_json::to_string(&spec.env).map_err(|e| QueueError::Corrupt(e.to_string()))?;
        let limits =
            serde_json::to_string(&spec.limits).map_err(|e| QueueError::Corrupt(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        for dep in &spec.dependencies {
            let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?1")
                .bind(dep.as_i64())
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(QueueError::DependencyNotFound(*dep));
            }
        }

        let result = sqlx::query(
            "INSERT INTO tasks
                (command, priority, status, scheduled_at, max_attempts, unique_key,
                 working_dir, env, limits, created_at, updated_at)
             VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(&command)
        .bind(spec.priority)
        .bind(scheduled_at)
        .bind(spec.max_attempts.max(1) as i64)
        .bind(&spec.unique_key)
        .bind(spec.working_dir.as_ref().map(|p| p.display().to_string()))
        .bind(&env)
        .bind(&limits)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::DuplicateKey(spec.unique_key.clone().unwrap_or_default())
            } else {
                e.into()
            }
        })?;

        let id = TaskId::new(result.last_insert_rowid());

        for dep in &spec.dependencies {
            sqlx::query("INSERT OR IGNORE INTO task_deps (task_id, depends_on_id) VALUES (?1, ?2)")
                .bind(id.as_i64())
                .bind(dep.as_i64())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.notify.notify_waiters();
        debug!(task = %id, "enqueued");
        Ok(id)
    }

    async fn add_dependency(&self, task: TaskId, depends_on: TaskId) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM tasks WHERE id = ?1")
            .bind(task.as_i64())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::TaskNotFound(task))?;
        let status: String = row.get("status");
        if status != "queued" {
            return Err(QueueError::InvalidState {
                id: task,
                found: TaskStatus::parse(&status).map(|s| s.as_str()).unwrap_or("unknown"),
                expected: "queued",
            });
        }

        let dep_exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(depends_on.as_i64())
            .fetch_optional(&mut *tx)
            .await?;
        if dep_exists.is_none() {
            return Err(QueueError::DependencyNotFound(depends_on));
        }

        let mut graph = DependencyGraph::new();
        let edges = sqlx::query("SELECT task_id, depends_on_id FROM task_deps")
            .fetch_all(&mut *tx)
            .await?;
        for edge in &edges {
            graph.add_dependency(
                TaskId::new(edge.get::<i64, _>("task_id")),
                TaskId::new(edge.get::<i64, _>("depends_on_id")),
            );
        }
        if let Some(cycle) = graph.would_cycle(task, depends_on) {
            return Err(QueueError::DependencyCycle(cycle));
        }

        sqlx::query("INSERT OR IGNORE INTO task_deps (task_id, depends_on_id) VALUES (?1, ?2)")
            .bind(task.as_i64())
            .bind(depends_on.as_i64())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let now = now_ms();
        let lease_expires = now + lease_timeout.as_millis() as i64;

        let sql = format!(
            "UPDATE tasks SET
                status = 'running',
                lease_owner = ?2,
                lease_expires_at = ?3,
                updated_at = ?1
             WHERE id = (
                SELECT t.id FROM tasks t
                WHERE {ELIGIBLE}
                ORDER BY t.priority DESC, t.scheduled_at ASC, t.id ASC
                LIMIT 1
             )
             AND status = 'queued'
             RETURNING *"
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(worker.as_str())
            .bind(lease_expires)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record = self.record_with_deps(&row).await?;
                debug!(task = %record.id, worker = %worker, "claimed");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn attach_unit(
        &self,
        task: TaskId,
        worker: &WorkerId,
        unit: &UnitName,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE tasks SET unit_name = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'running' AND lease_owner = ?4",
        )
        .bind(unit.as_str())
        .bind(now_ms())
        .bind(task.as_i64())
        .bind(worker.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize(
        &self,
        task: TaskId,
        worker: &WorkerId,
        outcome: TaskOutcome,
    ) -> Result<FinalizeOutcome, QueueError> {
        let row = sqlx::query(
            "SELECT status, lease_owner, attempts, max_attempts FROM tasks WHERE id = ?1",
        )
        .bind(task.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::TaskNotFound(task))?;

        let status: String = row.get("status");
        let lease_owner: Option<String> = row.get("lease_owner");
        if status != "running" || lease_owner.as_deref() != Some(worker.as_str()) {
            return Ok(FinalizeOutcome::Stale);
        }

        let attempts = row.get::<i64, _>("attempts") as u32;
        let max_attempts = row.get::<i64, _>("max_attempts") as u32;
        let new_attempts = attempts + 1;
        let now = now_ms();

        // The WHERE guard re-validates ownership; if the lease was reclaimed
        // between the read above and this update, zero rows change and the
        // caller learns it was stale.
        let (outcome, result) = match outcome {
            TaskOutcome::Success { exit_code } => {
                let result = sqlx::query(
                    "UPDATE tasks SET
                        status = 'done', attempts = ?1, exit_code = ?2, last_error = NULL,
                        lease_owner = NULL, lease_expires_at = NULL, unit_name = NULL,
                        updated_at = ?3
                     WHERE id = ?4 AND status = 'running' AND lease_owner = ?5",
                )
                .bind(new_attempts as i64)
                .bind(exit_code)
                .bind(now)
                .bind(task.as_i64())
                .bind(worker.as_str())
                .execute(&self.pool)
                .await?;
                (FinalizeOutcome::Done, result)
            }
            TaskOutcome::Failure { error, exit_code } => {
                match self.after_failure(new_attempts, max_attempts) {
                    (TaskStatus::Failed, _) => {
                        let result = sqlx::query(
                            "UPDATE tasks SET
                                status = 'failed', attempts = ?1, exit_code = ?2, last_error = ?3,
                                lease_owner = NULL, lease_expires_at = NULL, unit_name = NULL,
                                updated_at = ?4
                             WHERE id = ?5 AND status = 'running' AND lease_owner = ?6",
                        )
                        .bind(new_attempts as i64)
                        .bind(exit_code)
                        .bind(&error)
                        .bind(now)
                        .bind(task.as_i64())
                        .bind(worker.as_str())
                        .execute(&self.pool)
                        .await?;
                        (FinalizeOutcome::Failed, result)
                    }
                    (_, Some(next_ms)) => {
                        let result = sqlx::query(
                            "UPDATE tasks SET
                                status = 'queued', attempts = ?1, scheduled_at = ?2,
                                exit_code = ?3, last_error = ?4,
                                lease_owner = NULL, lease_expires_at = NULL, unit_name = NULL,
                                updated_at = ?5
                             WHERE id = ?6 AND status = 'running' AND lease_owner = ?7",
                        )
                        .bind(new_attempts as i64)
                        .bind(next_ms)
                        .bind(exit_code)
                        .bind(&error)
                        .bind(now)
                        .bind(task.as_i64())
                        .bind(worker.as_str())
                        .execute(&self.pool)
                        .await?;
                        let next_run_at = datetime_from_ms(next_ms, "scheduled_at")?;
                        (FinalizeOutcome::Retried { next_run_at }, result)
                    }
                    (_, None) => unreachable!("requeue always carries a schedule"),
                }
            }
        };

        if result.rows_affected() != 1 {
            return Ok(FinalizeOutcome::Stale);
        }
        if matches!(outcome, FinalizeOutcome::Retried { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<Vec<TaskId>, QueueError> {
        let now = now_ms();
        let expired = sqlx::query(
            "SELECT id, attempts, max_attempts FROM tasks
             WHERE status = 'running'
               AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::new();
        let mut requeued = false;
        for row in expired {
            let id = TaskId::new(row.get::<i64, _>("id"));
            let new_attempts = row.get::<i64, _>("attempts") as u32 + 1;
            let max_attempts = row.get::<i64, _>("max_attempts") as u32;

            let (status, next_ms) = self.after_failure(new_attempts, max_attempts);
            let result = sqlx::query(
                "UPDATE tasks SET
                    status = ?1, attempts = ?2, scheduled_at = COALESCE(?3, scheduled_at),
                    last_error = ?4,
                    lease_owner = NULL, lease_expires_at = NULL, unit_name = NULL,
                    updated_at = ?5
                 WHERE id = ?6 AND status = 'running'
                   AND lease_expires_at IS NOT NULL AND lease_expires_at < ?5",
            )
            .bind(status.as_str())
            .bind(new_attempts as i64)
            .bind(next_ms)
            .bind("lease expired without finalize; worker presumed dead")
            .bind(now)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                warn!(task = %id, status = status.as_str(), "reclaimed expired lease");
                reclaimed.push(id);
                requeued |= status == TaskStatus::Queued;
            }
        }

        if requeued {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn fail_unsatisfiable(&self) -> Result<Vec<TaskId>, QueueError> {
        let rows = sqlx::query(
            "UPDATE tasks SET
                status = 'failed',
                last_error = 'dependency failed permanently',
                updated_at = ?1
             WHERE status = 'queued' AND EXISTS (
                SELECT 1 FROM task_deps d
                JOIN tasks p ON p.id = d.depends_on_id
                WHERE d.task_id = tasks.id AND p.status = 'failed'
             )
             RETURNING id",
        )
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;

        let failed: Vec<TaskId> = rows
            .iter()
            .map(|r| TaskId::new(r.get::<i64, _>("id")))
            .collect();
        for id in &failed {
            warn!(task = %id, "failed: dependency failed permanently");
        }
        Ok(failed)
    }

    async fn adopt(
        &self,
        task: TaskId,
        worker: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<bool, QueueError> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE tasks SET lease_owner = ?1, lease_expires_at = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'running'",
        )
        .bind(worker.as_str())
        .bind(now + lease_timeout.as_millis() as i64)
        .bind(now)
        .bind(task.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn running(&self) -> Result<Vec<TaskRecord>, QueueError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = 'running' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.record_with_deps(row).await?);
        }
        Ok(records)
    }

    async fn get(&self, task: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.record_with_deps(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY id DESC LIMIT ?1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.record_with_deps(row).await?);
        }
        Ok(records)
    }

    async fn stats(&self) -> Result<StatusCounts, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let n = row.get::<i64, _>("n") as u64;
            match TaskStatus::parse(row.get::<&str, _>("status")) {
                Some(TaskStatus::Queued) => counts.queued = n,
                Some(TaskStatus::Running) => counts.running = n,
                Some(TaskStatus::Done) => counts.done = n,
                Some(TaskStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn prune(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = now_ms() - older_than.as_millis() as i64;
        let result = sqlx::query(
            "DELETE FROM tasks
             WHERE status IN ('done', 'failed') AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn wait_for_ready(&self, max_wait: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(max_wait) => {}
        }
    }
}
