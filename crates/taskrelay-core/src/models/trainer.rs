use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MailingListStatus {
    Subscribed,
    /// The provider refused the address; never retried automatically.
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trainer {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub has_subscription: bool,
    pub mailing_list_status: Option<MailingListStatus>,
    pub trial_tagged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub trainer_id: Uuid,
    pub title: String,
    pub body: String,
    /// Task that produced the notification; makes redelivery a no-op.
    pub source_task_id: Uuid,
}
