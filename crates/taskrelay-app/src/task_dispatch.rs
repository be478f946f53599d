//! Routes decoded tasks to their handlers.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use taskrelay_core::models::{Task, TaskKind};
use taskrelay_worker::TaskHandlerContext;

use crate::state::AppState;
use crate::task_handlers::{
    ChargePaymentPlansHandler, CreateNotificationHandler, DispatchDueSmsHandler,
    MailchimpSubscribeHandler, RefreshReceiptsHandler, SendSmsHandler, TagTrialledDidntSubHandler,
    TaskHandler,
};

#[async_trait]
impl TaskHandlerContext for AppState {
    async fn dispatch_task(self: Arc<Self>, task: &Task, kind: TaskKind) -> Result<serde_json::Value> {
        match kind {
            TaskKind::SendSms(payload) => SendSmsHandler.process(task, payload, self).await,
            TaskKind::MailchimpSubscribe(payload) => {
                MailchimpSubscribeHandler.process(task, payload, self).await
            }
            TaskKind::CreateNotification(payload) => {
                CreateNotificationHandler.process(task, payload, self).await
            }
            TaskKind::ChargePaymentPlans(payload) => {
                ChargePaymentPlansHandler.process(task, payload, self).await
            }
            TaskKind::RefreshReceipts(payload) => {
                RefreshReceiptsHandler.process(task, payload, self).await
            }
            TaskKind::TagTrialledDidntSub(payload) => {
                TagTrialledDidntSubHandler.process(task, payload, self).await
            }
            TaskKind::DispatchDueSms(payload) => {
                DispatchDueSmsHandler.process(task, payload, self).await
            }
        }
    }
}
