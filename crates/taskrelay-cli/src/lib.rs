use anyhow::Context;
use serde::Serialize;

use taskrelay_core::models::Task;
use taskrelay_core::{EnqueueOptions, NewTask};

/// Initialize tracing for CLI binaries.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

/// Build a validated task from a type tag and a JSON payload string.
pub fn parse_new_task(
    task_type: &str,
    payload: &str,
    dedupe_key: Option<String>,
) -> anyhow::Result<NewTask> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let mut options = EnqueueOptions::default();
    if let Some(key) = dedupe_key {
        options = options.dedupe_key(key);
    }
    Ok(NewTask::from_raw(task_type, &payload, options)?)
}

/// One-line summary for `failed` listings.
pub fn summarize(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "taskType": task.task_type,
        "attempts": format!("{}/{}", task.attempts, task.max_attempts),
        "lastError": task.last_error.as_deref().map(|e| truncate_string(e, 120)),
        "updatedAt": task.updated_at,
    })
}

/// Truncate a string to max_len characters, appending "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
