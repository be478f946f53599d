//! Dispatcher: worker pool, LISTEN/NOTIFY or polling, retry, stale-claim reaper.
//!
//! Any number of dispatchers may run against the same store; the store's claim
//! is the only mutual exclusion. Shutdown stops claiming, then waits up to the
//! configured grace period for in-flight handlers. Anything still running after
//! that is left `claimed` and comes back through the reaper.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use taskrelay_core::models::{Task, TaskKind, TaskType};
use taskrelay_core::{is_unrecoverable, DispatcherSettings, RetryBackoff, TaskStore};
use taskrelay_db::TASK_NOTIFY_CHANNEL;

use crate::context::TaskHandlerContext;
use crate::scheduler::RecurringScheduler;

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Budget for one handler invocation. Exceeding it counts as a failed attempt.
    pub task_timeout: Duration,
    /// Claims older than this are treated as abandoned.
    pub stale_claim_after: Duration,
    /// Zero runs the reaper once at startup only.
    pub reap_interval: Duration,
    pub backoff: RetryBackoff,
    pub shutdown_grace: Duration,
    /// Recorded in `tasks.claimed_by`.
    pub worker_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: Duration::from_millis(1000),
            task_timeout: Duration::from_secs(120),
            stale_claim_after: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            backoff: RetryBackoff::default(),
            shutdown_grace: Duration::from_secs(30),
            worker_id: default_worker_id(),
        }
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            max_workers: settings.max_workers,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            task_timeout: Duration::from_secs(settings.task_timeout_seconds),
            stale_claim_after: Duration::from_secs(settings.stale_claim_seconds),
            reap_interval: Duration::from_secs(settings.stale_reap_interval_seconds),
            backoff: RetryBackoff::new(
                Duration::from_secs(settings.retry_base_delay_seconds),
                Duration::from_secs(settings.retry_max_delay_seconds),
            ),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_seconds),
            worker_id: default_worker_id(),
        }
    }
}

/// `<hostname>-<pid>`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

/// What to do with a task whose handler did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    Retry { at: DateTime<Utc> },
    Fail,
}

pub(crate) fn failure_action(
    task: &Task,
    unrecoverable: bool,
    backoff: &RetryBackoff,
    now: DateTime<Utc>,
) -> FailureAction {
    if unrecoverable || !task.can_retry() {
        return FailureAction::Fail;
    }
    FailureAction::Retry {
        at: backoff.next_available_at(task.attempts, now, task.available_at),
    }
}

/// Recurring type and reference instant for the follow-up occurrence, if any.
///
/// Rescheduling from the later of the slot and `now` keeps a late run from
/// enqueueing slots that have already passed.
pub(crate) fn reschedule_from(
    task: &Task,
    kind: Option<&TaskKind>,
    now: DateTime<Utc>,
) -> Option<(TaskType, DateTime<Utc>)> {
    let task_type = task.known_type().filter(TaskType::is_recurring)?;
    let slot = kind.and_then(TaskKind::scheduled_for).unwrap_or(now);
    Some((task_type, slot.max(now)))
}

struct Worker {
    store: Arc<dyn TaskStore>,
    context: Arc<dyn TaskHandlerContext>,
    scheduler: RecurringScheduler,
    backoff: RetryBackoff,
    task_timeout: Duration,
}

/// Handle to a running dispatcher loop. Owned by the process composition root.
pub struct TaskDispatcher {
    shutdown_tx: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    shutdown_grace: Duration,
}

impl TaskDispatcher {
    /// Spawn the dispatcher loop and the stale-claim reaper.
    ///
    /// If `listener_pool` is `Some`, the loop also wakes on PostgreSQL
    /// NOTIFY from [`taskrelay_db::enqueue`]; polling continues either way.
    pub fn start(
        store: Arc<dyn TaskStore>,
        context: Arc<dyn TaskHandlerContext>,
        scheduler: RecurringScheduler,
        config: DispatcherConfig,
        listener_pool: Option<sqlx::PgPool>,
    ) -> Result<Self> {
        if config.max_workers == 0 {
            anyhow::bail!("Dispatcher needs at least one worker");
        }
        if config.poll_interval.is_zero() {
            anyhow::bail!("Dispatcher poll interval must be greater than zero");
        }

        tracing::info!(
            worker_id = %config.worker_id,
            max_workers = config.max_workers,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            task_timeout_secs = config.task_timeout.as_secs(),
            listen_notify = listener_pool.is_some(),
            "Task dispatcher starting"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let mut background = Vec::new();

        // Wakes the main loop when LISTEN receives a NOTIFY.
        let (notify_tx, notify_rx) = mpsc::channel::<()>(16);
        if let Some(pool) = listener_pool {
            background.push(tokio::spawn(listen_for_new_tasks(pool, notify_tx)));
        }

        background.push(tokio::spawn(reap_stale_claims(
            store.clone(),
            scheduler.clone(),
            config.stale_claim_after,
            config.reap_interval,
            shutdown_rx.clone(),
        )));

        let worker = Arc::new(Worker {
            store,
            context,
            scheduler,
            backoff: config.backoff,
            task_timeout: config.task_timeout,
        });

        let loop_handle = tokio::spawn(run_loop(
            worker,
            semaphore.clone(),
            config.worker_id,
            config.poll_interval,
            notify_rx,
            shutdown_rx,
        ));

        Ok(Self {
            shutdown_tx,
            loop_handle,
            background,
            semaphore,
            max_workers: config.max_workers,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Stop claiming and wait for in-flight handlers, bounded by the grace period.
    pub async fn shutdown(self) {
        tracing::info!("Initiating task dispatcher shutdown");
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.loop_handle.await {
            tracing::error!(error = %e, "Dispatcher loop ended abnormally");
        }
        for handle in &self.background {
            handle.abort();
        }

        let permits = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.shutdown_grace, self.semaphore.acquire_many(permits)).await {
            Ok(_) => tracing::info!("Task dispatcher stopped"),
            Err(_) => {
                let in_flight = self.max_workers - self.semaphore.available_permits();
                tracing::warn!(
                    in_flight,
                    grace_secs = self.shutdown_grace.as_secs(),
                    "Shutdown grace period elapsed with tasks still running; they will be reclaimed"
                );
            }
        }
    }
}

async fn run_loop(
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>,
    worker_id: String,
    poll_interval: Duration,
    mut notify_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        claim_available(&worker, &semaphore, &worker_id).await;

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            Some(()) = notify_rx.recv() => {}
            _ = sleep(poll_interval) => {}
        }

        if *shutdown_rx.borrow() {
            break;
        }
    }

    tracing::info!("Task dispatcher loop stopped claiming");
}

/// Claim and spawn tasks until the store has nothing eligible or every worker is busy.
async fn claim_available(worker: &Arc<Worker>, semaphore: &Arc<Semaphore>, worker_id: &str) {
    loop {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::trace!("No workers available, skipping claim");
                return;
            }
        };

        match worker.store.claim_next(worker_id).await {
            Ok(Some(task)) => {
                let worker = worker.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.process_task(task).await;
                });
            }
            Ok(None) => {
                tracing::trace!("No tasks available");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim task");
                return;
            }
        }
    }
}

impl Worker {
    #[tracing::instrument(skip(self, task), fields(task.id = %task.id, task.type = %task.task_type, attempts = task.attempts))]
    async fn process_task(&self, task: Task) {
        let kind = match task.kind() {
            Ok(kind) => Some(kind),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Task cannot be decoded, failing without retry"
                );
                self.record_failure(&task, &e.to_string()).await;
                None
            }
        };

        let follow_up = reschedule_from(&task, kind.as_ref(), Utc::now());

        if let Some(kind) = kind {
            let outcome = tokio::time::timeout(
                self.task_timeout,
                self.context.clone().dispatch_task(&task, kind),
            )
            .await
            .unwrap_or_else(|_| {
                Err(anyhow!(
                    "Task execution timed out after {}s",
                    self.task_timeout.as_secs()
                ))
            });
            self.record_outcome(&task, outcome).await;
        }

        // A failed or undecodable occurrence must not end the series.
        if let Some((task_type, from)) = follow_up {
            if let Err(e) = self.scheduler.schedule_next(task_type, from).await {
                tracing::error!(
                    task_type = %task_type,
                    error = %e,
                    "Failed to schedule next recurring occurrence"
                );
            }
        }
    }

    async fn record_outcome(&self, task: &Task, outcome: Result<serde_json::Value>) {
        let error = match outcome {
            Ok(value) => {
                match self.store.mark_done(task, value).await {
                    Ok(true) => tracing::info!("Task completed"),
                    Ok(false) => tracing::warn!("Task finished but its row was no longer active"),
                    Err(e) => tracing::error!(error = %e, "Failed to mark task as done"),
                }
                return;
            }
            Err(e) => e,
        };

        let unrecoverable = is_unrecoverable(&error);
        let message = format!("{:#}", error);

        match failure_action(task, unrecoverable, &self.backoff, Utc::now()) {
            FailureAction::Retry { at } => {
                tracing::warn!(
                    error = %message,
                    max_attempts = task.max_attempts,
                    retry_at = %at,
                    "Task failed, scheduling retry"
                );
                match self.store.schedule_retry(task, at, &message).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!("Retry not recorded, claim was lost"),
                    Err(e) => tracing::error!(error = %e, "Failed to schedule task retry"),
                }
            }
            FailureAction::Fail => {
                tracing::error!(
                    error = %message,
                    max_attempts = task.max_attempts,
                    unrecoverable,
                    "Task failed permanently"
                );
                self.record_failure(task, &message).await;
            }
        }
    }

    async fn record_failure(&self, task: &Task, message: &str) {
        match self.store.mark_failed(task, message).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Failure not recorded, claim was lost"),
            Err(e) => tracing::error!(error = %e, "Failed to mark task as failed"),
        }
    }
}

async fn listen_for_new_tasks(pool: sqlx::PgPool, tx: mpsc::Sender<()>) {
    loop {
        match sqlx::postgres::PgListener::connect_with(&pool).await {
            Ok(mut listener) => {
                if let Err(e) = listener.listen(TASK_NOTIFY_CHANNEL).await {
                    tracing::warn!(error = %e, "LISTEN failed, will retry");
                    sleep(LISTENER_RETRY_DELAY).await;
                    continue;
                }
                tracing::debug!(channel = TASK_NOTIFY_CHANNEL, "Listening for new tasks");
                while listener.recv().await.is_ok() {
                    // A full channel already holds a pending wake-up.
                    let _ = tx.try_send(());
                }
                tracing::warn!("Task listener disconnected, falling back to polling until reconnected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "PgListener connect failed, will retry");
                sleep(LISTENER_RETRY_DELAY).await;
            }
        }
    }
}

async fn reap_stale_claims(
    store: Arc<dyn TaskStore>,
    scheduler: RecurringScheduler,
    stale_after: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    reap_once(store.as_ref(), &scheduler, stale_after).await;
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately and the startup pass already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => reap_once(store.as_ref(), &scheduler, stale_after).await,
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn reap_once(store: &dyn TaskStore, scheduler: &RecurringScheduler, stale_after: Duration) {
    let now = Utc::now();
    let Some(cutoff) = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
    else {
        tracing::error!(stale_after_secs = stale_after.as_secs(), "Stale claim window out of range, reaper skipped");
        return;
    };

    let outcome = match store.reclaim_stale(cutoff).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "Stale claim reaper failed");
            return;
        }
    };

    scheduler.resume_abandoned(&outcome.abandoned, now).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use taskrelay_core::models::TaskStatus;
    use taskrelay_core::TaskError;
    use uuid::Uuid;

    fn claimed(task_type: &str, attempts: i32, max_attempts: i32) -> Task {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Task {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            payload: json!({}),
            dedupe_key: None,
            status: TaskStatus::Claimed,
            attempts,
            max_attempts,
            available_at: now,
            last_error: None,
            result: None,
            claimed_by: Some("w".into()),
            created_at: now,
            claimed_at: Some(now),
            completed_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn retry_uses_backoff_while_budget_remains() {
        let backoff = RetryBackoff::new(Duration::from_secs(30), Duration::from_secs(3600));
        let task = claimed("sendSms", 2, 5);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 5).unwrap();

        assert_eq!(
            failure_action(&task, false, &backoff, now),
            FailureAction::Retry {
                at: now + chrono::Duration::seconds(60)
            }
        );
    }

    #[test]
    fn exhausted_or_unrecoverable_fails() {
        let backoff = RetryBackoff::default();
        let now = Utc::now();
        assert_eq!(
            failure_action(&claimed("sendSms", 2, 2), false, &backoff, now),
            FailureAction::Fail
        );
        assert_eq!(
            failure_action(&claimed("sendSms", 1, 5), true, &backoff, now),
            FailureAction::Fail
        );
    }

    #[test]
    fn unrecoverable_detected_through_context() {
        use anyhow::Context;
        let err: anyhow::Error = Err::<(), _>(TaskError::unrecoverable(anyhow!("no creds")))
            .context("sending sms")
            .unwrap_err();
        assert!(is_unrecoverable(&err));
        assert!(!is_unrecoverable(&anyhow!("network")));
    }

    #[test]
    fn recurring_follow_up_starts_from_slot_or_now() {
        let task = claimed("refreshReceipts", 1, 2);
        let slot = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let kind = TaskKind::recurring(TaskType::RefreshReceipts, slot).unwrap();

        let early = Utc.with_ymd_and_hms(2024, 1, 1, 12, 29, 0).unwrap();
        assert_eq!(
            reschedule_from(&task, Some(&kind), early),
            Some((TaskType::RefreshReceipts, slot))
        );

        let late = Utc.with_ymd_and_hms(2024, 1, 1, 13, 10, 0).unwrap();
        assert_eq!(
            reschedule_from(&task, Some(&kind), late),
            Some((TaskType::RefreshReceipts, late))
        );

        // Undecodable payload still keeps the series going.
        assert_eq!(
            reschedule_from(&task, None, late),
            Some((TaskType::RefreshReceipts, late))
        );
    }

    #[test]
    fn one_off_and_unknown_types_have_no_follow_up() {
        let now = Utc::now();
        assert_eq!(reschedule_from(&claimed("sendSms", 1, 5), None, now), None);
        assert_eq!(reschedule_from(&claimed("legacyJob", 1, 5), None, now), None);
    }

    #[test]
    fn config_from_settings() {
        let settings = DispatcherSettings {
            max_workers: 8,
            poll_interval_ms: 250,
            listen_notify: true,
            task_timeout_seconds: 60,
            stale_claim_seconds: 300,
            stale_reap_interval_seconds: 30,
            retry_base_delay_seconds: 10,
            retry_max_delay_seconds: 100,
            shutdown_grace_seconds: 5,
        };
        let config = DispatcherConfig::from(&settings);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.backoff.delay(5), Duration::from_secs(100));
        assert!(!config.worker_id.is_empty());
    }
}
