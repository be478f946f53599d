//! Recurring scheduler.
//!
//! Maps `(task_type, from)` to the next slot of the type's cadence and enqueues
//! that occurrence under a slot-derived dedupe key, so any number of callers
//! scheduling the same slot leave exactly one active row.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use taskrelay_core::models::{Task, TaskKind, TaskType};
use taskrelay_core::{slot_dedupe_key, EnqueueError, EnqueueOptions, TaskHandle, TaskStore};

use crate::dispatcher::reschedule_from;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("{0} is not a recurring task type")]
    NotRecurring(TaskType),
    #[error("cadence of {task_type} has no occurrence after {from}")]
    NoNextOccurrence {
        task_type: TaskType,
        from: DateTime<Utc>,
    },
    #[error("failed to enqueue {task_type} occurrence at {fire_at}: {source}")]
    Enqueue {
        task_type: TaskType,
        fire_at: DateTime<Utc>,
        #[source]
        source: EnqueueError,
    },
}

#[derive(Clone)]
pub struct RecurringScheduler {
    store: Arc<dyn TaskStore>,
}

impl RecurringScheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Next firing time of `task_type` strictly after `from`.
    pub fn next_occurrence(
        task_type: TaskType,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let cadence = task_type
            .cadence()
            .ok_or(ScheduleError::NotRecurring(task_type))?;
        cadence
            .next_after(from)
            .ok_or(ScheduleError::NoNextOccurrence { task_type, from })
    }

    /// Enqueue the occurrence following `from`. Idempotent per slot.
    #[tracing::instrument(skip(self), fields(task_type = %task_type))]
    pub async fn schedule_next(
        &self,
        task_type: TaskType,
        from: DateTime<Utc>,
    ) -> Result<TaskHandle, ScheduleError> {
        let fire_at = Self::next_occurrence(task_type, from)?;
        let kind =
            TaskKind::recurring(task_type, fire_at).ok_or(ScheduleError::NotRecurring(task_type))?;
        let options = EnqueueOptions::default()
            .available_at(fire_at)
            .dedupe_key(slot_dedupe_key(task_type, fire_at));

        let handle = self
            .store
            .submit(kind, options)
            .await
            .map_err(|source| ScheduleError::Enqueue {
                task_type,
                fire_at,
                source,
            })?;

        tracing::debug!(
            task_id = %handle.id,
            fire_at = %fire_at,
            deduplicated = handle.deduplicated,
            "Recurring occurrence scheduled"
        );
        Ok(handle)
    }

    /// Schedule the next occurrence of every recurring type after `now`.
    ///
    /// Every type is attempted; the first failure is returned once all have run.
    pub async fn seed_all(&self, now: DateTime<Utc>) -> Result<Vec<TaskHandle>, ScheduleError> {
        let mut handles = Vec::with_capacity(TaskType::RECURRING.len());
        let mut first_error = None;

        for task_type in TaskType::RECURRING {
            match self.schedule_next(task_type, now).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(task_type = %task_type, error = %e, "Failed to seed recurring task");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(count = handles.len(), "Recurring tasks seeded");
                Ok(handles)
            }
        }
    }

    /// Schedule the follow-up of every recurring occurrence in `abandoned`.
    ///
    /// Used for rows the stale-claim sweep failed, which never reach a
    /// worker. Errors are logged and the remaining rows still run.
    pub async fn resume_abandoned(&self, abandoned: &[Task], now: DateTime<Utc>) -> Vec<TaskHandle> {
        let mut handles = Vec::new();
        for task in abandoned {
            let Some((task_type, from)) = reschedule_from(task, task.kind().ok().as_ref(), now)
            else {
                continue;
            };
            match self.schedule_next(task_type, from).await {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(
                    task.id = %task.id,
                    task_type = %task_type,
                    error = %e,
                    "Failed to schedule next recurring occurrence after reclaim"
                ),
            }
        }
        handles
    }
}
