use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    /// Written by the application, waiting for `send_at`.
    Scheduled,
    /// Handed to the dispatcher as a `sendSms` task.
    Queued,
    Sent,
    Failed,
}

impl SmsStatus {
    /// A terminal message must never reach the provider again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SmsStatus::Sent | SmsStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SmsMessage {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub to_number: String,
    pub body: String,
    pub status: SmsStatus,
    pub send_at: DateTime<Utc>,
    pub provider_sid: Option<String>,
    pub failure_reason: Option<String>,
}
