use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use taskrelay_core::models::{MailchimpSubscribePayload, MailingListStatus, Task};
use taskrelay_infra::ProviderError;

use super::{missing, provider_failure, TaskHandler};
use crate::state::AppState;

pub struct MailchimpSubscribeHandler;

#[async_trait]
impl TaskHandler for MailchimpSubscribeHandler {
    type Payload = MailchimpSubscribePayload;

    async fn process(
        &self,
        _task: &Task,
        payload: MailchimpSubscribePayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let trainer = state
            .trainers
            .get(payload.trainer_id)
            .await?
            .ok_or_else(|| missing("Trainer", payload.trainer_id))?;

        if let Some(status) = trainer.mailing_list_status {
            return Ok(json!({ "status": "skipped", "mailingListStatus": status }));
        }

        let status = match state
            .mailing_list
            .subscribe(&trainer.email, trainer.first_name.as_deref())
            .await
        {
            Ok(()) => MailingListStatus::Subscribed,
            Err(ProviderError::Rejected { code, message, .. }) => {
                tracing::warn!(trainer_id = %trainer.id, code = %code, reason = %message, "Mailing list rejected trainer email");
                MailingListStatus::Rejected
            }
            Err(e) => return Err(provider_failure(e)),
        };

        state
            .trainers
            .set_mailing_list_status(trainer.id, status)
            .await?;

        Ok(json!({ "status": status }))
    }
}
