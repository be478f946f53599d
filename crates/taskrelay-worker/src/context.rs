//! Task handler context trait
//!
//! The application implements this trait for its state. The dispatcher decodes
//! each claimed row into a [`TaskKind`] and hands it to `dispatch_task`; the
//! implementation matches on the kind and invokes the matching handler.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use taskrelay_core::models::{Task, TaskKind};

#[async_trait]
pub trait TaskHandlerContext: Send + Sync {
    /// Run the handler for `kind` and return the value stored in `tasks.result`.
    ///
    /// Errors wrapped in [`taskrelay_core::TaskError::unrecoverable`] fail the
    /// task immediately; any other error consumes an attempt.
    async fn dispatch_task(self: Arc<Self>, task: &Task, kind: TaskKind) -> Result<serde_json::Value>;
}
