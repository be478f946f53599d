//! taskrelay-admin: inspect and repair the task table.
//!
//! Connects straight to the database named by DATABASE_URL.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

use taskrelay_cli::{init_tracing, parse_new_task, print_json, summarize};
use taskrelay_core::TaskStore;
use taskrelay_db::TaskRepository;
use taskrelay_worker::RecurringScheduler;

#[derive(Parser)]
#[command(name = "taskrelay-admin", about = "taskrelay task table administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Row counts per status
    Stats,
    /// List failed tasks, most recent first
    Failed {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show a single task by ID
    Show { id: Uuid },
    /// Return a failed task to pending with a fresh attempt budget
    Requeue { id: Uuid },
    /// Enqueue a task by type tag and JSON payload
    Enqueue {
        task_type: String,
        /// Payload as a JSON object
        payload: String,
        #[arg(long)]
        dedupe_key: Option<String>,
    },
    /// Reclaim claims older than the given age
    Reap {
        #[arg(long, default_value = "600")]
        older_than_secs: i64,
    },
    /// Schedule the next occurrence of every recurring task type
    Seed,
    /// Delete finished tasks older than the given number of days
    Purge {
        #[arg(long, default_value = "30")]
        days: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = taskrelay_db::connect(&database_url, 2, 10).await?;
    let tasks = TaskRepository::new(pool);

    match cli.command {
        Commands::Stats => {
            print_json(&tasks.stats().await?)?;
        }
        Commands::Failed { limit } => {
            let failed = tasks.list_failed(limit).await?;
            let rows: Vec<_> = failed.iter().map(summarize).collect();
            print_json(&rows)?;
        }
        Commands::Show { id } => match tasks.get(id).await? {
            Some(task) => print_json(&task)?,
            None => anyhow::bail!("Task {} not found", id),
        },
        Commands::Requeue { id } => match tasks.requeue_failed(id).await? {
            Some(task) => print_json(&summarize(&task))?,
            None => anyhow::bail!("Task {} not found or not failed", id),
        },
        Commands::Enqueue {
            task_type,
            payload,
            dedupe_key,
        } => {
            let task = parse_new_task(&task_type, &payload, dedupe_key)?;
            print_json(&tasks.enqueue(task).await?)?;
        }
        Commands::Reap { older_than_secs } => {
            let now = Utc::now();
            let cutoff = now - chrono::Duration::seconds(older_than_secs.max(0));
            let outcome = tasks.reclaim_stale(cutoff).await?;
            let scheduler = RecurringScheduler::new(Arc::new(tasks.clone()));
            let resumed = scheduler.resume_abandoned(&outcome.abandoned, now).await;
            print_json(&serde_json::json!({
                "requeued": outcome.requeued,
                "failed": outcome.failed,
                "rescheduled": resumed.len(),
            }))?;
        }
        Commands::Seed => {
            let scheduler = RecurringScheduler::new(Arc::new(tasks.clone()));
            print_json(&scheduler.seed_all(Utc::now()).await?)?;
        }
        Commands::Purge { days } => {
            if days < 1 {
                anyhow::bail!("--days must be at least 1");
            }
            let deleted = tasks.delete_old_finished_tasks(days).await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
    }

    Ok(())
}
