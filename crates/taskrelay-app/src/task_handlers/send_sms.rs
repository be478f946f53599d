use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use taskrelay_core::models::{CreateNotificationPayload, SendSmsPayload, Task, TaskKind};
use taskrelay_core::{EnqueueOptions, NewTask};
use taskrelay_infra::ProviderError;

use super::{missing, provider_failure, TaskHandler};
use crate::state::AppState;

/// Sends one SMS row through the provider.
///
/// A row that is already `sent` or `failed` is left alone, so redelivery after
/// a crash never sends twice. A provider rejection is terminal for the
/// message: the row is failed and the trainer is told, in one transaction.
pub struct SendSmsHandler;

#[async_trait]
impl TaskHandler for SendSmsHandler {
    type Payload = SendSmsPayload;

    async fn process(
        &self,
        _task: &Task,
        payload: SendSmsPayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let sms = state
            .sms
            .get(payload.sms_id)
            .await?
            .ok_or_else(|| missing("SMS", payload.sms_id))?;

        if sms.status.is_terminal() {
            tracing::info!(sms_id = %sms.id, status = ?sms.status, "SMS already resolved, skipping send");
            return Ok(json!({ "status": "skipped", "smsStatus": sms.status }));
        }

        match state.sms_sender.send(&sms.to_number, &sms.body).await {
            Ok(provider_sid) => {
                state
                    .sms
                    .mark_sent(sms.id, &provider_sid)
                    .await
                    .context("SMS sent but could not be marked sent")?;
                tracing::info!(sms_id = %sms.id, provider_sid = %provider_sid, "SMS sent");
                Ok(json!({ "status": "sent", "providerSid": provider_sid }))
            }
            Err(ProviderError::Rejected { code, message, .. }) => {
                tracing::warn!(sms_id = %sms.id, code = %code, reason = %message, "SMS rejected by provider");
                let notify = NewTask::new(
                    TaskKind::CreateNotification(CreateNotificationPayload {
                        trainer_id: sms.trainer_id,
                        title: "Message not delivered".to_string(),
                        body: format!(
                            "Your message to {} could not be delivered: {}",
                            sms.to_number, message
                        ),
                    }),
                    EnqueueOptions::default()
                        .dedupe_key(format!("createNotification:sms-failed:{}", sms.id)),
                )?;
                state
                    .sms
                    .mark_failed(sms.id, &message, Some(notify))
                    .await?;
                Ok(json!({ "status": "failed", "code": code }))
            }
            Err(e) => Err(provider_failure(e)),
        }
    }
}
