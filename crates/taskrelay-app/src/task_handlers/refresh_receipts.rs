use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use taskrelay_core::models::{RecurringPayload, Task};
use taskrelay_infra::ProviderError;

use super::{provider_failure, TaskHandler};
use crate::state::AppState;

const EXPIRY_WINDOW_HOURS: i64 = 24;
const SUBSCRIPTION_BATCH_SIZE: i64 = 200;

/// Re-verifies App Store receipts for subscriptions about to expire.
pub struct RefreshReceiptsHandler;

#[async_trait]
impl TaskHandler for RefreshReceiptsHandler {
    type Payload = RecurringPayload;

    async fn process(
        &self,
        _task: &Task,
        payload: RecurringPayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let horizon = payload.scheduled_for + Duration::hours(EXPIRY_WINDOW_HOURS);
        let subscriptions = state
            .billing
            .expiring_subscriptions(horizon, SUBSCRIPTION_BATCH_SIZE)
            .await?;

        let mut renewed = 0u32;
        let mut lapsed = 0u32;

        for subscription in subscriptions {
            let (expires_at, active) = match state.receipts.verify(&subscription.latest_receipt).await {
                Ok(status) => (
                    status.expires_at.unwrap_or(subscription.expires_at),
                    status.active,
                ),
                Err(ProviderError::Rejected { code, message, .. }) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        code = %code,
                        reason = %message,
                        "Receipt rejected, deactivating subscription"
                    );
                    (subscription.expires_at, false)
                }
                Err(e) => {
                    return Err(provider_failure(e)).with_context(|| {
                        format!("Failed to verify receipt for subscription {}", subscription.id)
                    })
                }
            };

            if active {
                renewed += 1;
            } else {
                lapsed += 1;
            }
            state
                .billing
                .update_subscription(subscription.id, expires_at, active)
                .await?;
        }

        Ok(json!({ "renewed": renewed, "lapsed": lapsed }))
    }
}
