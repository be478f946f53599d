//! In-memory task store.
//!
//! Same transition rules as the PostgreSQL repository, with a single mutex
//! standing in for row locks. Used by the dispatcher tests and for running the
//! worker without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use taskrelay_core::models::{Task, TaskStats, TaskStatus};
use taskrelay_core::{NewTask, ReclaimOutcome, TaskHandle, TaskStore};

const CLAIM_ABANDONED: &str = "claim abandoned";

#[derive(Default)]
pub struct MemoryTaskStore {
    // Insertion order doubles as the `created_at` tie-break.
    tasks: Mutex<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, in insertion order.
    pub async fn all(&self) -> Vec<Task> {
        self.tasks.lock().await.clone()
    }

    /// Active rows holding `dedupe_key`.
    pub async fn active_with_key(&self, dedupe_key: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.status.is_active() && t.dedupe_key.as_deref() == Some(dedupe_key))
            .cloned()
            .collect()
    }

    /// Move `claimed_at` into the past, as if the claimant had stalled.
    pub async fn backdate_claim(&self, task_id: Uuid, claimed_at: DateTime<Utc>) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) if task.status == TaskStatus::Claimed => {
                task.claimed_at = Some(claimed_at);
                true
            }
            _ => false,
        }
    }
}

fn held_by_claim(row: &Task, claim: &Task) -> bool {
    row.id == claim.id && row.status == TaskStatus::Claimed && row.attempts == claim.attempts
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskHandle> {
        let mut tasks = self.tasks.lock().await;

        if let Some(key) = task.dedupe_key.as_deref() {
            if let Some(existing) = tasks
                .iter()
                .find(|t| t.status.is_active() && t.dedupe_key.as_deref() == Some(key))
            {
                return Ok(TaskHandle::existing(existing.id));
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        tasks.push(Task {
            id,
            task_type: task.task_type.as_str().to_string(),
            payload: task.payload,
            dedupe_key: task.dedupe_key,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: task.max_attempts,
            available_at: task.available_at.unwrap_or(now),
            last_error: None,
            result: None,
            claimed_by: None,
            created_at: now,
            claimed_at: None,
            completed_at: None,
            updated_at: now,
        });
        Ok(TaskHandle::inserted(id))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();

        let next = tasks
            .iter_mut()
            .filter(|t| t.is_claimable_at(now))
            .min_by_key(|t| t.available_at);

        Ok(next.map(|task| {
            task.status = TaskStatus::Claimed;
            task.attempts += 1;
            task.claimed_at = Some(now);
            task.claimed_by = Some(worker_id.to_string());
            task.updated_at = now;
            task.clone()
        }))
    }

    async fn mark_done(&self, task: &Task, result: serde_json::Value) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        match tasks.iter_mut().find(|t| t.id == task.id && t.status.is_active()) {
            Some(row) => {
                row.status = TaskStatus::Done;
                row.result = Some(result);
                row.completed_at = Some(now);
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn schedule_retry(
        &self,
        task: &Task,
        retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.iter_mut().find(|t| held_by_claim(t, task)) {
            Some(row) => {
                row.status = TaskStatus::Pending;
                row.available_at = row.available_at.max(retry_at);
                row.last_error = Some(error.to_string());
                row.claimed_at = None;
                row.claimed_by = None;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, task: &Task, error: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        match tasks.iter_mut().find(|t| held_by_claim(t, task)) {
            Some(row) => {
                row.status = TaskStatus::Failed;
                row.last_error = Some(error.to_string());
                row.completed_at = Some(now);
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<ReclaimOutcome> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        let mut outcome = ReclaimOutcome::default();

        let stale = tasks.iter_mut().filter(|t| {
            t.status == TaskStatus::Claimed && t.claimed_at.map_or(false, |at| at < claimed_before)
        });
        for row in stale {
            row.last_error = Some(CLAIM_ABANDONED.to_string());
            row.claimed_by = None;
            row.updated_at = now;
            if row.attempts >= row.max_attempts {
                row.status = TaskStatus::Failed;
                row.completed_at = Some(now);
                outcome.failed += 1;
                outcome.abandoned.push(row.clone());
            } else {
                row.status = TaskStatus::Pending;
                row.available_at = row.available_at.max(now);
                outcome.requeued += 1;
            }
        }

        Ok(outcome)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn stats(&self) -> Result<TaskStats> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.iter().fold(TaskStats::default(), |mut stats, task| {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Claimed => stats.claimed += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
            stats
        }))
    }
}
