use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use uuid::Uuid;

use taskrelay_core::models::{Task, TaskStats, TaskStatus};
use taskrelay_core::{NewTask, ReclaimOutcome, TaskHandle, TaskStore};

/// Channel for PostgreSQL LISTEN/NOTIFY when a task is inserted.
pub const TASK_NOTIFY_CHANNEL: &str = "taskrelay_new_task";

const ACTIVE_DEDUPE_INDEX: &str = "tasks_active_dedupe_key";

/// Error recorded on rows the stale-claim sweep takes back.
pub const CLAIM_ABANDONED: &str = "claim abandoned";

/// Insert `task` on the caller's connection.
///
/// Pass a pooled connection for a standalone insert or `&mut *tx` to make the
/// task part of an open transaction: the row and its wake-up notification then
/// only become visible when the caller commits, and vanish if it rolls back.
#[tracing::instrument(skip(conn, task), fields(task.type = %task.task_type, dedupe_key = ?task.dedupe_key))]
pub async fn enqueue(conn: &mut PgConnection, task: &NewTask) -> Result<TaskHandle> {
    // The active row holding our key can finish between the insert and the
    // lookup; one more insert then succeeds.
    for _ in 0..2 {
        let inserted: Option<Uuid> = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO tasks (task_type, payload, dedupe_key, available_at, max_attempts)
            VALUES ($1, $2, $3, COALESCE($4, NOW()), $5)
            ON CONFLICT (dedupe_key) WHERE status IN ('pending', 'claimed') DO NOTHING
            RETURNING id
            "#,
        )
        .bind(task.task_type.as_str())
        .bind(&task.payload)
        .bind(task.dedupe_key.as_deref())
        .bind(task.available_at)
        .bind(task.max_attempts)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to insert task")?;

        if let Some(id) = inserted {
            // Delivered on commit. Not swallowed: a failed statement would
            // abort the caller's transaction anyway.
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(TASK_NOTIFY_CHANNEL)
                .bind(id.to_string())
                .execute(&mut *conn)
                .await
                .context("Failed to send pg_notify for new task")?;

            tracing::info!(task_id = %id, task_type = %task.task_type, "Task enqueued");
            return Ok(TaskHandle::inserted(id));
        }

        let key = task
            .dedupe_key
            .as_deref()
            .context("Insert returned no row for a task without a dedupe key")?;

        let existing: Option<Uuid> = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            SELECT id
            FROM tasks
            WHERE dedupe_key = $1
                AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to look up task holding dedupe key")?;

        if let Some(id) = existing {
            tracing::debug!(task_id = %id, dedupe_key = %key, "Active task already holds dedupe key, enqueue skipped");
            return Ok(TaskHandle::existing(id));
        }
    }

    anyhow::bail!("Dedupe key kept conflicting without a visible active task")
}

#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Most recently failed tasks, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn list_failed(&self, limit: i64) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<Postgres, Task>(
            r#"
            SELECT *
            FROM tasks
            WHERE status = 'failed'
            ORDER BY completed_at DESC NULLS LAST
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list failed tasks")?;

        Ok(tasks)
    }

    /// Give a failed task a fresh attempt budget.
    ///
    /// Returns `None` when the task does not exist or is not failed. Errors when
    /// another active task already holds the same dedupe key.
    #[tracing::instrument(skip(self))]
    pub async fn requeue_failed(&self, task_id: Uuid) -> Result<Option<Task>> {
        let result = sqlx::query_as::<Postgres, Task>(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempts = 0,
                available_at = NOW(),
                claimed_at = NULL,
                claimed_by = NULL,
                completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await;

        let task = match result {
            Ok(task) => task,
            Err(e) if violates_active_dedupe(&e) => {
                anyhow::bail!(
                    "Cannot requeue task {}: another active task holds its dedupe key",
                    task_id
                )
            }
            Err(e) => return Err(e).context("Failed to requeue task"),
        };

        if let Some(task) = &task {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(TASK_NOTIFY_CHANNEL)
                .bind(task.id.to_string())
                .execute(&self.pool)
                .await
                .context("Failed to send pg_notify for requeued task")?;
            tracing::info!(task_id = %task.id, task_type = %task.task_type, "Task manually requeued");
        }

        Ok(task)
    }

    /// Delete done and failed tasks finished more than `older_than_days` ago.
    /// Returns the number of rows deleted.
    #[tracing::instrument(skip(self))]
    pub async fn delete_old_finished_tasks(&self, older_than_days: i32) -> Result<u64> {
        let row = sqlx::query(
            r#"
            WITH deleted AS (
                DELETE FROM tasks
                WHERE status IN ('done', 'failed')
                    AND COALESCE(completed_at, updated_at) < NOW() - ($1 * interval '1 day')
                RETURNING id
            )
            SELECT COUNT(*)::bigint FROM deleted
            "#,
        )
        .bind(older_than_days)
        .fetch_one(&self.pool)
        .await
        .context("Failed to delete old finished tasks")?;

        let count: i64 = row.get(0);
        let count = count.max(0) as u64;

        if count > 0 {
            tracing::info!(count, older_than_days, "Deleted old finished tasks");
        }

        Ok(count)
    }
}

fn violates_active_dedupe(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.constraint())
        .map(|constraint| constraint == ACTIVE_DEDUPE_INDEX)
        .unwrap_or(false)
}

#[async_trait]
impl TaskStore for TaskRepository {
    async fn enqueue(&self, task: NewTask) -> Result<TaskHandle> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for enqueue")?;
        enqueue(&mut conn, &task).await
    }

    #[tracing::instrument(skip(self))]
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<Postgres, Task>(
            r#"
            UPDATE tasks
            SET status = 'claimed',
                attempts = attempts + 1,
                claimed_at = NOW(),
                claimed_by = $1,
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM tasks
                WHERE status = 'pending'
                    AND available_at <= NOW()
                    AND attempts < max_attempts
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim next task")?;

        if let Some(task) = &task {
            tracing::debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempts = task.attempts,
                max_attempts = task.max_attempts,
                "Task claimed"
            );
        }

        Ok(task)
    }

    #[tracing::instrument(skip(self, task, result), fields(task.id = %task.id))]
    async fn mark_done(&self, task: &Task, result: serde_json::Value) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'done',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
                AND status IN ('claimed', 'pending')
            "#,
        )
        .bind(task.id)
        .bind(result)
        .execute(&self.pool)
        .await
        .context("Failed to mark task as done")?
        .rows_affected();

        Ok(updated > 0)
    }

    #[tracing::instrument(skip(self, task, error), fields(task.id = %task.id))]
    async fn schedule_retry(
        &self,
        task: &Task,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                available_at = GREATEST(available_at, $3),
                last_error = $4,
                claimed_at = NULL,
                claimed_by = NULL,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'claimed'
                AND attempts = $2
            "#,
        )
        .bind(task.id)
        .bind(task.attempts)
        .bind(retry_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to schedule task retry")?
        .rows_affected();

        Ok(updated > 0)
    }

    #[tracing::instrument(skip(self, task, error), fields(task.id = %task.id))]
    async fn mark_failed(&self, task: &Task, error: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                last_error = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
                AND status = 'claimed'
                AND attempts = $2
            "#,
        )
        .bind(task.id)
        .bind(task.attempts)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark task as failed")?
        .rows_affected();

        Ok(updated > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<ReclaimOutcome> {
        let reclaimed: Vec<Task> = sqlx::query_as::<Postgres, Task>(
            r#"
            WITH stale AS (
                SELECT id
                FROM tasks
                WHERE status = 'claimed'
                    AND claimed_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET status = CASE
                    WHEN t.attempts >= t.max_attempts THEN 'failed'::task_status
                    ELSE 'pending'::task_status
                END,
                available_at = GREATEST(t.available_at, NOW()),
                completed_at = CASE WHEN t.attempts >= t.max_attempts THEN NOW() ELSE NULL END,
                last_error = $2,
                claimed_by = NULL,
                updated_at = NOW()
            FROM stale
            WHERE t.id = stale.id
            RETURNING t.*
            "#,
        )
        .bind(claimed_before)
        .bind(CLAIM_ABANDONED)
        .fetch_all(&self.pool)
        .await
        .context("Failed to reclaim stale tasks")?;

        let mut outcome = ReclaimOutcome::default();
        for task in reclaimed {
            if task.status == TaskStatus::Failed {
                outcome.failed += 1;
                outcome.abandoned.push(task);
            } else {
                outcome.requeued += 1;
            }
        }

        if !outcome.is_empty() {
            tracing::warn!(
                requeued = outcome.requeued,
                failed = outcome.failed,
                "Reclaimed stale task claims"
            );
        }

        Ok(outcome)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        let task = sqlx::query_as::<Postgres, Task>("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch task")?;

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn stats(&self) -> Result<TaskStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'claimed') as claimed,
                COUNT(*) FILTER (WHERE status = 'done') as done,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch task stats")?;

        Ok(TaskStats {
            total: row.get::<Option<i64>, _>("total").unwrap_or(0),
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            claimed: row.get::<Option<i64>, _>("claimed").unwrap_or(0),
            done: row.get::<Option<i64>, _>("done").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
        })
    }
}
