//! Dispatcher and scheduler driven end to end against the in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use taskrelay_core::models::{
    RecurringPayload, SendSmsPayload, Task, TaskKind, TaskStatus, TaskType,
};
use taskrelay_core::{slot_dedupe_key, EnqueueOptions, NewTask, RetryBackoff, TaskError, TaskStore};
use taskrelay_worker::{
    DispatcherConfig, MemoryTaskStore, RecurringScheduler, TaskDispatcher, TaskHandlerContext,
};

type Behaviour = Box<dyn Fn(usize) -> Result<serde_json::Value> + Send + Sync>;

/// Handler context whose result depends on how many times a task has been run.
struct ScriptedContext {
    behaviour: Behaviour,
    delay: Duration,
    calls: AtomicUsize,
    runs_per_task: Mutex<HashMap<Uuid, usize>>,
}

impl ScriptedContext {
    fn new(behaviour: impl Fn(usize) -> Result<serde_json::Value> + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, behaviour)
    }

    fn with_delay(
        delay: Duration,
        behaviour: impl Fn(usize) -> Result<serde_json::Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Box::new(behaviour),
            delay,
            calls: AtomicUsize::new(0),
            runs_per_task: Mutex::new(HashMap::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandlerContext for ScriptedContext {
    async fn dispatch_task(self: Arc<Self>, task: &Task, _kind: TaskKind) -> Result<serde_json::Value> {
        let run = {
            let mut runs = self.runs_per_task.lock().unwrap();
            let count = runs.entry(task.id).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behaviour)(run)
    }
}

fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        max_workers: 2,
        poll_interval: Duration::from_millis(10),
        task_timeout: Duration::from_secs(5),
        stale_claim_after: Duration::from_secs(60),
        reap_interval: Duration::ZERO,
        backoff: RetryBackoff::new(Duration::ZERO, Duration::ZERO),
        shutdown_grace: Duration::from_secs(2),
        worker_id: "test-worker".to_string(),
    }
}

fn start(
    store: &Arc<MemoryTaskStore>,
    context: Arc<ScriptedContext>,
    config: DispatcherConfig,
) -> TaskDispatcher {
    let store: Arc<dyn TaskStore> = store.clone();
    TaskDispatcher::start(
        store.clone(),
        context,
        RecurringScheduler::new(store),
        config,
        None,
    )
    .unwrap()
}

fn sms_task(options: EnqueueOptions) -> NewTask {
    NewTask::new(
        TaskKind::SendSms(SendSmsPayload {
            sms_id: Uuid::new_v4(),
        }),
        options,
    )
    .unwrap()
}

async fn wait_for<F>(store: &MemoryTaskStore, mut done: F) -> Vec<Task>
where
    F: FnMut(&[Task]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let tasks = store.all().await;
        if done(&tasks) {
            return tasks;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached, store: {:#?}",
            tasks
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(store: &MemoryTaskStore, id: Uuid, status: TaskStatus) -> Task {
    let tasks = wait_for(store, |tasks| {
        tasks.iter().any(|t| t.id == id && t.status == status)
    })
    .await;
    tasks.into_iter().find(|t| t.id == id).unwrap()
}

#[tokio::test]
async fn transient_failure_is_retried_once_then_fails() {
    let store = Arc::new(MemoryTaskStore::new());
    let handle = store
        .enqueue(sms_task(EnqueueOptions::default().max_attempts(2)))
        .await
        .unwrap();
    let context = ScriptedContext::new(|_| Err(anyhow!("provider timeout")));

    let dispatcher = start(&store, context.clone(), test_config());
    let task = wait_for_status(&store, handle.id, TaskStatus::Failed).await;
    dispatcher.shutdown().await;

    assert_eq!(task.attempts, 2);
    assert_eq!(context.calls(), 2);
    assert_eq!(task.last_error.as_deref(), Some("provider timeout"));
    assert!(store.claim_next("other").await.unwrap().is_none());
}

#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let store = Arc::new(MemoryTaskStore::new());
    let handle = store
        .enqueue(sms_task(EnqueueOptions::default()))
        .await
        .unwrap();
    let context = ScriptedContext::new(|run| {
        if run == 1 {
            Err(anyhow!("connection reset"))
        } else {
            Ok(json!({ "sent": true }))
        }
    });

    let dispatcher = start(&store, context, test_config());
    let task = wait_for_status(&store, handle.id, TaskStatus::Done).await;
    dispatcher.shutdown().await;

    assert_eq!(task.attempts, 2);
    assert_eq!(task.result, Some(json!({ "sent": true })));
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn unrecoverable_error_skips_remaining_attempts() {
    let store = Arc::new(MemoryTaskStore::new());
    let handle = store
        .enqueue(sms_task(EnqueueOptions::default().max_attempts(5)))
        .await
        .unwrap();
    let context =
        ScriptedContext::new(|_| Err(TaskError::unrecoverable(anyhow!("TWILIO_AUTH_TOKEN is not set")).into()));

    let dispatcher = start(&store, context.clone(), test_config());
    let task = wait_for_status(&store, handle.id, TaskStatus::Failed).await;
    dispatcher.shutdown().await;

    assert_eq!(task.attempts, 1);
    assert_eq!(context.calls(), 1);
}

#[tokio::test]
async fn undecodable_payload_fails_without_running_handler() {
    let store = Arc::new(MemoryTaskStore::new());
    // Written by a build with a different payload shape.
    let handle = store
        .enqueue(NewTask {
            task_type: TaskType::SendSms,
            payload: json!({ "messageId": 42 }),
            dedupe_key: None,
            available_at: None,
            max_attempts: 5,
        })
        .await
        .unwrap();
    let context = ScriptedContext::new(|_| Ok(json!(null)));

    let dispatcher = start(&store, context.clone(), test_config());
    let task = wait_for_status(&store, handle.id, TaskStatus::Failed).await;
    dispatcher.shutdown().await;

    assert_eq!(task.attempts, 1);
    assert_eq!(context.calls(), 0);
    assert!(task
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("malformed sendSms payload"));
}

#[tokio::test]
async fn handler_timeout_consumes_an_attempt() {
    let store = Arc::new(MemoryTaskStore::new());
    let handle = store
        .enqueue(sms_task(EnqueueOptions::default().max_attempts(1)))
        .await
        .unwrap();
    let context = ScriptedContext::with_delay(Duration::from_secs(2), |_| Ok(json!(null)));
    let config = DispatcherConfig {
        task_timeout: Duration::from_millis(50),
        ..test_config()
    };

    let dispatcher = start(&store, context, config);
    let task = wait_for_status(&store, handle.id, TaskStatus::Failed).await;
    dispatcher.shutdown().await;

    assert_eq!(task.attempts, 1);
    assert!(task.last_error.unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn failed_recurring_occurrence_still_schedules_next() {
    let store = Arc::new(MemoryTaskStore::new());
    let slot = Utc::now() - chrono::Duration::minutes(1);
    let current_key = slot_dedupe_key(TaskType::DispatchDueSms, slot);
    let handle = store
        .submit(
            TaskKind::DispatchDueSms(RecurringPayload { scheduled_for: slot }),
            EnqueueOptions::default()
                .available_at(slot)
                .dedupe_key(current_key.clone()),
        )
        .await
        .unwrap();
    let context = ScriptedContext::new(|_| Err(anyhow!("sms table locked")));

    let dispatcher = start(&store, context, test_config());
    let tasks = wait_for(&store, |tasks| {
        tasks
            .iter()
            .any(|t| t.dedupe_key.as_deref() != Some(current_key.as_str()))
    })
    .await;
    dispatcher.shutdown().await;

    let current = tasks.iter().find(|t| t.id == handle.id).unwrap();
    assert_eq!(current.status, TaskStatus::Failed);

    let next = tasks.iter().find(|t| t.id != handle.id).unwrap();
    assert_eq!(next.task_type, "dispatchDueSms");
    assert!(next.available_at > slot);
    assert_eq!(
        next.dedupe_key,
        Some(slot_dedupe_key(TaskType::DispatchDueSms, next.available_at))
    );
}

#[tokio::test]
async fn duplicate_slot_enqueue_leaves_one_active_row() {
    let store = MemoryTaskStore::new();
    let slot = "2024-01-02T00:00:00Z".parse().unwrap();
    let key = "chargePaymentPlans:2024-01-02T00:00:00.000Z";

    for _ in 0..2 {
        store
            .submit(
                TaskKind::ChargePaymentPlans(RecurringPayload { scheduled_for: slot }),
                EnqueueOptions::default().dedupe_key(key),
            )
            .await
            .unwrap();
    }

    assert_eq!(store.active_with_key(key).await.len(), 1);
}

#[tokio::test]
async fn seeding_twice_creates_no_duplicates() {
    let store: Arc<MemoryTaskStore> = Arc::new(MemoryTaskStore::new());
    let scheduler = RecurringScheduler::new(store.clone());
    let now = Utc::now();

    let first = scheduler.seed_all(now).await.unwrap();
    let second = scheduler.seed_all(now).await.unwrap();

    assert_eq!(first.len(), TaskType::RECURRING.len());
    assert!(second.iter().all(|h| h.deduplicated));

    let tasks = store.all().await;
    for task_type in TaskType::RECURRING {
        let active = tasks
            .iter()
            .filter(|t| t.task_type == task_type.as_str() && t.status.is_active())
            .count();
        assert_eq!(active, 1, "{task_type}");
    }
}

#[tokio::test]
async fn concurrent_dispatchers_run_each_task_once() {
    let store = Arc::new(MemoryTaskStore::new());
    for _ in 0..20 {
        store
            .enqueue(sms_task(EnqueueOptions::default()))
            .await
            .unwrap();
    }
    let context = ScriptedContext::with_delay(Duration::from_millis(5), |_| Ok(json!(null)));

    let a = start(&store, context.clone(), test_config());
    let b = start(&store, context.clone(), test_config());
    wait_for(&store, |tasks| tasks.iter().all(|t| t.status == TaskStatus::Done)).await;
    a.shutdown().await;
    b.shutdown().await;

    assert_eq!(context.calls(), 20);
    let runs = context.runs_per_task.lock().unwrap();
    assert!(runs.values().all(|count| *count == 1));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_task() {
    let store = Arc::new(MemoryTaskStore::new());
    let handle = store
        .enqueue(sms_task(EnqueueOptions::default()))
        .await
        .unwrap();
    let context = ScriptedContext::with_delay(Duration::from_millis(200), |_| Ok(json!(null)));

    let dispatcher = start(&store, context, test_config());
    wait_for_status(&store, handle.id, TaskStatus::Claimed).await;
    dispatcher.shutdown().await;

    let task = store.get(handle.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
}

#[tokio::test]
async fn abandoned_claim_is_recovered_at_startup() {
    let store = Arc::new(MemoryTaskStore::new());
    let handle = store
        .enqueue(sms_task(EnqueueOptions::default()))
        .await
        .unwrap();
    let crashed = store.claim_next("crashed-worker").await.unwrap().unwrap();
    store
        .backdate_claim(crashed.id, Utc::now() - chrono::Duration::hours(1))
        .await;

    let context = ScriptedContext::new(|_| Ok(json!(null)));
    let dispatcher = start(&store, context, test_config());
    let task = wait_for_status(&store, handle.id, TaskStatus::Done).await;
    dispatcher.shutdown().await;

    assert_eq!(task.attempts, 2);
    assert_eq!(task.last_error.as_deref(), Some("claim abandoned"));
}

#[tokio::test]
async fn reclaimed_recurring_occurrence_keeps_series() {
    let store = Arc::new(MemoryTaskStore::new());
    let slot = Utc::now() - chrono::Duration::minutes(2);
    let handle = store
        .submit(
            TaskKind::DispatchDueSms(RecurringPayload { scheduled_for: slot }),
            EnqueueOptions::default()
                .available_at(slot)
                .max_attempts(1)
                .dedupe_key(slot_dedupe_key(TaskType::DispatchDueSms, slot)),
        )
        .await
        .unwrap();
    let crashed = store.claim_next("crashed-worker").await.unwrap().unwrap();
    store
        .backdate_claim(crashed.id, Utc::now() - chrono::Duration::hours(1))
        .await;

    let context = ScriptedContext::new(|_| Ok(json!(null)));
    let dispatcher = start(&store, context, test_config());
    let tasks = wait_for(&store, |tasks| {
        tasks.iter().any(|t| {
            t.id != handle.id && t.task_type == "dispatchDueSms" && t.status.is_active()
        })
    })
    .await;
    dispatcher.shutdown().await;

    let reclaimed = tasks.iter().find(|t| t.id == handle.id).unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Failed);
    assert_eq!(reclaimed.last_error.as_deref(), Some("claim abandoned"));

    let next = tasks.iter().find(|t| t.id != handle.id).unwrap();
    assert!(next.available_at > slot);
    assert_eq!(
        next.dedupe_key,
        Some(slot_dedupe_key(TaskType::DispatchDueSms, next.available_at))
    );
}

#[tokio::test]
async fn in_flight_handlers_never_exceed_max_workers() {
    let store = Arc::new(MemoryTaskStore::new());
    for _ in 0..8 {
        store
            .enqueue(sms_task(EnqueueOptions::default()))
            .await
            .unwrap();
    }
    let context = ScriptedContext::with_delay(Duration::from_millis(30), |_| Ok(json!(null)));

    let dispatcher = start(&store, context, test_config());
    let mut peak = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let tasks = store.all().await;
        let claimed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Claimed)
            .count();
        peak = peak.max(claimed);
        if tasks.iter().all(|t| t.status == TaskStatus::Done) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tasks did not finish");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    dispatcher.shutdown().await;

    assert!(peak >= 1);
    assert!(peak <= test_config().max_workers, "peak {peak}");
}
