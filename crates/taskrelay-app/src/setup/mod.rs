//! Application setup and lifecycle
//!
//! [`initialize_app`] wires configuration, telemetry, the pool, repositories
//! and provider clients. [`App::run`] starts the dispatcher, seeds recurring
//! work, and blocks until a shutdown signal arrives.

pub mod database;
pub mod retention;
pub mod services;
pub mod signal;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use taskrelay_core::{Config, TaskStore};
use taskrelay_db::TaskRepository;
use taskrelay_worker::{DispatcherConfig, RecurringScheduler, TaskDispatcher, TaskHandlerContext};

use crate::state::AppState;

/// Owns the one dispatcher a process may run.
#[derive(Default)]
pub struct DispatcherSlot {
    running: Option<TaskDispatcher>,
}

impl DispatcherSlot {
    /// Start the dispatcher. Fails if this slot already holds a running one.
    pub fn start(
        &mut self,
        store: Arc<dyn TaskStore>,
        context: Arc<dyn TaskHandlerContext>,
        scheduler: RecurringScheduler,
        config: DispatcherConfig,
        listener_pool: Option<PgPool>,
    ) -> Result<()> {
        if self.running.is_some() {
            anyhow::bail!("Task dispatcher is already running in this process");
        }
        let dispatcher = TaskDispatcher::start(store, context, scheduler, config, listener_pool)?;
        self.running = Some(dispatcher);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Drain and stop the dispatcher, if one is running.
    pub async fn shutdown(&mut self) {
        if let Some(dispatcher) = self.running.take() {
            dispatcher.shutdown().await;
        }
    }
}

pub struct App {
    pub config: Config,
    pub pool: PgPool,
    pub tasks: TaskRepository,
    pub state: Arc<AppState>,
    pub scheduler: RecurringScheduler,
    dispatcher: DispatcherSlot,
    retention: Option<JoinHandle<()>>,
}

/// Initialize everything up to, but not including, the dispatcher.
pub async fn initialize_app(config: Config) -> Result<App> {
    config.validate().context("Configuration validation failed")?;

    taskrelay_infra::init_telemetry(config.base.log_format, &config.base.environment)
        .context("Failed to initialize telemetry")?;

    tracing::info!(
        environment = %config.base.environment,
        "Configuration loaded and validated successfully"
    );

    let pool = database::setup_database(&config).await?;
    let state = services::initialize_services(&config, &pool)?;
    let tasks = TaskRepository::new(pool.clone());
    let scheduler = RecurringScheduler::new(Arc::new(tasks.clone()));

    Ok(App {
        config,
        pool,
        tasks,
        state,
        scheduler,
        dispatcher: DispatcherSlot::default(),
        retention: None,
    })
}

impl App {
    /// Start the dispatcher, seed recurring tasks and the retention sweep.
    pub async fn start(&mut self) -> Result<()> {
        let listener_pool = self
            .config
            .dispatcher
            .listen_notify
            .then(|| self.pool.clone());

        self.dispatcher.start(
            Arc::new(self.tasks.clone()),
            self.state.clone(),
            self.scheduler.clone(),
            DispatcherConfig::from(&self.config.dispatcher),
            listener_pool,
        )?;

        // A failed seed is retried on the next start; it must not stop dispatching.
        if let Err(e) = self.scheduler.seed_all(Utc::now()).await {
            tracing::error!(error = %e, "Recurring task seeding incomplete");
        }

        self.retention = retention::start_retention_sweep(
            self.tasks.clone(),
            self.config.task_retention_days,
            Duration::from_secs(self.config.retention_sweep_interval_seconds),
        );
        Ok(())
    }

    /// Stop the sweep and drain the dispatcher.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.retention.take() {
            handle.abort();
        }
        self.dispatcher.shutdown().await;
        self.pool.close().await;
        tracing::info!("taskrelay stopped");
    }

    /// Start, then block until SIGINT or SIGTERM and shut down.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;
        tracing::info!(
            max_workers = self.config.dispatcher.max_workers,
            "taskrelay running"
        );
        signal::shutdown_signal().await;
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestContext;
    use taskrelay_worker::MemoryTaskStore;

    fn start_in(slot: &mut DispatcherSlot, ctx: &TestContext) -> Result<()> {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        slot.start(
            store.clone(),
            ctx.state.clone(),
            RecurringScheduler::new(store),
            DispatcherConfig {
                shutdown_grace: Duration::from_secs(1),
                ..DispatcherConfig::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn second_start_in_same_slot_is_rejected() {
        let ctx = TestContext::new();
        let mut slot = DispatcherSlot::default();

        start_in(&mut slot, &ctx).unwrap();
        let err = start_in(&mut slot, &ctx).unwrap_err();
        assert!(err.to_string().contains("already running"));

        slot.shutdown().await;
        assert!(!slot.is_running());
        start_in(&mut slot, &ctx).unwrap();
        slot.shutdown().await;
    }
}
