use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use taskrelay_core::models::{CreateNotificationPayload, NewNotification, Task};

use super::TaskHandler;
use crate::state::AppState;

/// Inserts an in-app notification, keyed by the task id so redelivery inserts nothing.
pub struct CreateNotificationHandler;

#[async_trait]
impl TaskHandler for CreateNotificationHandler {
    type Payload = CreateNotificationPayload;

    async fn process(
        &self,
        task: &Task,
        payload: CreateNotificationPayload,
        state: Arc<AppState>,
    ) -> Result<serde_json::Value> {
        let created = state
            .trainers
            .insert_notification(&NewNotification {
                trainer_id: payload.trainer_id,
                title: payload.title,
                body: payload.body,
                source_task_id: task.id,
            })
            .await?;

        Ok(json!({ "created": created }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{claimed_task, TestContext};
    use uuid::Uuid;

    #[tokio::test]
    async fn redelivery_creates_one_notification() {
        let ctx = TestContext::new();
        let task = claimed_task("createNotification");
        let payload = CreateNotificationPayload {
            trainer_id: Uuid::new_v4(),
            title: "Payment declined".into(),
            body: "Card ending 4242 was declined".into(),
        };

        let first = CreateNotificationHandler
            .process(&task, payload.clone(), ctx.state.clone())
            .await
            .unwrap();
        let second = CreateNotificationHandler
            .process(&task, payload, ctx.state.clone())
            .await
            .unwrap();

        assert_eq!(first["created"], true);
        assert_eq!(second["created"], false);
        assert_eq!(ctx.trainers.notifications.lock().unwrap().len(), 1);
    }
}
