use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use taskrelay_core::models::{RecurringPayload, Task};

use super::TaskHandler;
use crate::state::AppState;

const DUE_SMS_BATCH_SIZE: i64 = 500;

/// Moves scheduled SMS rows that are due to `queued` and enqueues a `sendSms`
/// task for each, in the same transaction.
pub struct DispatchDueSmsHandler;

#[async_trait]
impl TaskHandler for DispatchDueSmsHandler {
    type Payload = RecurringPayload;

    async fn process(
        &self,
        _task: &Task,
        payload: RecurringPayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let now = Utc::now().max(payload.scheduled_for);
        let queued = state.sms.queue_due(now, DUE_SMS_BATCH_SIZE).await?;

        if !queued.is_empty() {
            tracing::info!(count = queued.len(), "Queued due SMS messages");
        }
        Ok(json!({ "queued": queued.len() }))
    }
}
