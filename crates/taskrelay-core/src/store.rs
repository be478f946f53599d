//! Task store contract.
//!
//! The durable table of task rows is the only thing dispatchers share. Every
//! state transition here is a conditional update: a call whose precondition no
//! longer holds changes nothing and reports `false`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::enqueue::{EnqueueError, EnqueueOptions, NewTask, TaskHandle};
use crate::models::{Task, TaskKind, TaskStats};

/// Result of one stale-claim sweep.
#[derive(Debug, Default, Clone)]
pub struct ReclaimOutcome {
    /// Returned to `pending`.
    pub requeued: u64,
    /// Abandoned with no attempts left, moved to `failed`.
    pub failed: u64,
    /// The rows moved to `failed`, as they now stand.
    pub abandoned: Vec<Task>,
}

impl ReclaimOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a pending row, or resolve to the active row holding the same
    /// dedupe key.
    async fn enqueue(&self, task: NewTask) -> Result<TaskHandle>;

    /// Atomically move the earliest eligible row from `pending` to `claimed`,
    /// incrementing `attempts`. Eligible means `available_at <= now` and
    /// `attempts < max_attempts`.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>>;

    /// `claimed` (or reclaimed `pending`) → `done`.
    async fn mark_done(&self, task: &Task, result: serde_json::Value) -> Result<bool>;

    /// `claimed` → `pending` with `available_at = max(available_at, retry_at)`.
    ///
    /// Only applies while the row is still held by the claim `task` came from
    /// (same `attempts`), so a late caller cannot undo a newer claim.
    async fn schedule_retry(&self, task: &Task, retry_at: DateTime<Utc>, error: &str)
        -> Result<bool>;

    /// `claimed` → `failed`. Terminal. Same claim check as [`TaskStore::schedule_retry`].
    async fn mark_failed(&self, task: &Task, error: &str) -> Result<bool>;

    /// Return rows claimed before `claimed_before` to `pending`, or fail them
    /// when their attempt budget is spent.
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<ReclaimOutcome>;

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>>;

    async fn stats(&self) -> Result<TaskStats>;

    /// Validate and enqueue a typed task.
    async fn submit(
        &self,
        kind: TaskKind,
        options: EnqueueOptions,
    ) -> Result<TaskHandle, EnqueueError> {
        let task = NewTask::new(kind, options)?;
        Ok(self.enqueue(task).await?)
    }
}
