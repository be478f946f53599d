mod charge_payment_plans;
mod create_notification;
mod dispatch_due_sms;
mod mailchimp_subscribe;
mod refresh_receipts;
mod send_sms;
mod tag_trialled_didnt_sub;

pub use charge_payment_plans::ChargePaymentPlansHandler;
pub use create_notification::CreateNotificationHandler;
pub use dispatch_due_sms::DispatchDueSmsHandler;
pub use mailchimp_subscribe::MailchimpSubscribeHandler;
pub use refresh_receipts::RefreshReceiptsHandler;
pub use send_sms::SendSmsHandler;
pub use tag_trialled_didnt_sub::TagTrialledDidntSubHandler;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use taskrelay_core::models::Task;
use taskrelay_core::TaskError;
use taskrelay_infra::ProviderError;

use crate::state::AppState;

/// One handler per task type, receiving the already decoded payload.
///
/// Handlers run at least once per task, so each one checks its own domain row
/// before repeating an external side effect.
#[async_trait]
pub trait TaskHandler {
    type Payload: Send + 'static;

    async fn process(
        &self,
        task: &Task,
        payload: Self::Payload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value>;
}

/// Error for a provider failure the handler did not resolve locally.
///
/// Misconfiguration fails the task outright; anything else takes the retry path.
pub(crate) fn provider_failure(err: ProviderError) -> anyhow::Error {
    match err {
        ProviderError::Misconfigured { .. } => TaskError::unrecoverable(err).into(),
        other => other.into(),
    }
}

/// Error for a task whose target row no longer exists.
pub(crate) fn missing(what: &str, id: uuid::Uuid) -> anyhow::Error {
    TaskError::unrecoverable(anyhow::anyhow!("{} {} not found", what, id)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrelay_core::is_unrecoverable;

    #[test]
    fn misconfiguration_is_not_retried() {
        let err = provider_failure(ProviderError::Misconfigured {
            provider: "twilio",
            message: "TWILIO_AUTH_TOKEN is not set".into(),
        });
        assert!(is_unrecoverable(&err));

        let err = provider_failure(ProviderError::Transient {
            provider: "twilio",
            message: "503".into(),
        });
        assert!(!is_unrecoverable(&err));
    }
}
