//! Periodic deletion of old finished tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use taskrelay_db::TaskRepository;

/// Spawn the sweep. `None` when retention is disabled.
pub fn start_retention_sweep(
    tasks: TaskRepository,
    retention_days: i32,
    every: Duration,
) -> Option<JoinHandle<()>> {
    if retention_days <= 0 || every.is_zero() {
        tracing::info!("Task retention sweep disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = tasks.delete_old_finished_tasks(retention_days).await {
                tracing::error!(error = %e, "Task retention sweep failed");
            }
        }
    }))
}
