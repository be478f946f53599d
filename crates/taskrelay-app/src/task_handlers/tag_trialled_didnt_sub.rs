use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use taskrelay_core::models::{RecurringPayload, Task};
use taskrelay_infra::ProviderError;

use super::{provider_failure, TaskHandler};
use crate::state::AppState;

pub const TRIALLED_DIDNT_SUB_TAG: &str = "trialled-didnt-sub";
const TRAINER_BATCH_SIZE: i64 = 200;

/// Tags trainers whose trial ended without a subscription.
pub struct TagTrialledDidntSubHandler;

#[async_trait]
impl TaskHandler for TagTrialledDidntSubHandler {
    type Payload = RecurringPayload;

    async fn process(
        &self,
        _task: &Task,
        payload: RecurringPayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let trainers = state
            .trainers
            .trialled_didnt_subscribe(payload.scheduled_for, TRAINER_BATCH_SIZE)
            .await?;

        let mut tagged = 0u32;
        let mut skipped = 0u32;

        for trainer in trainers {
            match state
                .mailing_list
                .add_tag(&trainer.email, TRIALLED_DIDNT_SUB_TAG)
                .await
            {
                Ok(()) => tagged += 1,
                Err(ProviderError::Rejected { code, message, .. }) => {
                    // Not on the list; marking it tagged stops it coming back every run.
                    tracing::warn!(trainer_id = %trainer.id, code = %code, reason = %message, "Could not tag trainer");
                    skipped += 1;
                }
                Err(e) => {
                    return Err(provider_failure(e))
                        .with_context(|| format!("Failed to tag trainer {}", trainer.id))
                }
            }
            state.trainers.mark_trial_tagged(trainer.id).await?;
        }

        Ok(json!({ "tagged": tagged, "skipped": skipped }))
    }
}
