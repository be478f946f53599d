use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use crate::cadence::{Cadence, SlotTime};

/// Every task type the dispatcher knows how to run.
///
/// The string tags are what is persisted in `tasks.task_type`; rows carrying any
/// other tag fail with [`PayloadError::UnknownType`] when claimed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskType {
    #[serde(rename = "sendSms")]
    SendSms,
    #[serde(rename = "mailchimp.subscribe")]
    MailchimpSubscribe,
    #[serde(rename = "createNotification")]
    CreateNotification,
    #[serde(rename = "chargePaymentPlans")]
    ChargePaymentPlans,
    #[serde(rename = "refreshReceipts")]
    RefreshReceipts,
    #[serde(rename = "tagTrialledDidntSub")]
    TagTrialledDidntSub,
    #[serde(rename = "dispatchDueSms")]
    DispatchDueSms,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::SendSms,
        TaskType::MailchimpSubscribe,
        TaskType::CreateNotification,
        TaskType::ChargePaymentPlans,
        TaskType::RefreshReceipts,
        TaskType::TagTrialledDidntSub,
        TaskType::DispatchDueSms,
    ];

    /// Types that reschedule themselves after every run.
    pub const RECURRING: [TaskType; 4] = [
        TaskType::ChargePaymentPlans,
        TaskType::RefreshReceipts,
        TaskType::TagTrialledDidntSub,
        TaskType::DispatchDueSms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SendSms => "sendSms",
            TaskType::MailchimpSubscribe => "mailchimp.subscribe",
            TaskType::CreateNotification => "createNotification",
            TaskType::ChargePaymentPlans => "chargePaymentPlans",
            TaskType::RefreshReceipts => "refreshReceipts",
            TaskType::TagTrialledDidntSub => "tagTrialledDidntSub",
            TaskType::DispatchDueSms => "dispatchDueSms",
        }
    }

    /// Attempt ceiling used when the enqueue call does not override it.
    pub fn default_max_attempts(&self) -> i32 {
        match self {
            TaskType::SendSms => 5,
            TaskType::MailchimpSubscribe => 5,
            TaskType::CreateNotification => 3,
            TaskType::ChargePaymentPlans => 3,
            TaskType::RefreshReceipts => 2,
            TaskType::TagTrialledDidntSub => 2,
            TaskType::DispatchDueSms => 1,
        }
    }

    /// Firing cadence for recurring types, `None` for one-off work.
    pub fn cadence(&self) -> Option<Cadence> {
        match self {
            TaskType::ChargePaymentPlans => Some(Cadence::DailyAt(vec![SlotTime::new(0, 0)])),
            TaskType::RefreshReceipts => Some(Cadence::HourlyAt(vec![0, 30])),
            TaskType::TagTrialledDidntSub => Some(Cadence::DailyAt(vec![
                SlotTime::new(9, 0),
                SlotTime::new(21, 0),
            ])),
            TaskType::DispatchDueSms => Some(Cadence::EveryMinute),
            TaskType::SendSms | TaskType::MailchimpSubscribe | TaskType::CreateNotification => {
                None
            }
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.cadence().is_some()
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PayloadError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl TaskStatus {
    /// Active rows are the ones a dedupe key is unique among.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Claimed)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Claimed => write!(f, "claimed"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// One row of the `tasks` table.
///
/// `task_type` stays a raw string so that rows written by a newer or older build
/// can still be loaded and failed cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            dedupe_key: row.try_get("dedupe_key")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            available_at: row.try_get("available_at")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Task {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.available_at <= now && self.can_retry()
    }

    /// Known type for this row, if the tag is one this build understands.
    pub fn known_type(&self) -> Option<TaskType> {
        self.task_type.parse().ok()
    }

    /// Resolve the tag and decode the payload into its typed variant.
    pub fn kind(&self) -> Result<TaskKind, PayloadError> {
        TaskKind::from_parts(&self.task_type, &self.payload)
    }
}

/// Typed task payload.
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Semantic checks serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSmsPayload {
    pub sms_id: Uuid,
}

impl TaskPayload for SendSmsPayload {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailchimpSubscribePayload {
    pub trainer_id: Uuid,
}

impl TaskPayload for MailchimpSubscribePayload {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationPayload {
    pub trainer_id: Uuid,
    pub title: String,
    pub body: String,
}

impl TaskPayload for CreateNotificationPayload {
    fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be empty".to_string());
        }
        if self.body.trim().is_empty() {
            return Err("body must not be empty".to_string());
        }
        Ok(())
    }
}

/// Payload shared by all recurring types: the slot this occurrence belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringPayload {
    pub scheduled_for: DateTime<Utc>,
}

impl TaskPayload for RecurringPayload {}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown task type: {0}")]
    UnknownType(String),
    #[error("malformed {task_type} payload: {source}")]
    Malformed {
        task_type: TaskType,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {task_type} payload: {reason}")]
    Invalid { task_type: TaskType, reason: String },
}

/// A task type together with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    SendSms(SendSmsPayload),
    MailchimpSubscribe(MailchimpSubscribePayload),
    CreateNotification(CreateNotificationPayload),
    ChargePaymentPlans(RecurringPayload),
    RefreshReceipts(RecurringPayload),
    TagTrialledDidntSub(RecurringPayload),
    DispatchDueSms(RecurringPayload),
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::SendSms(_) => TaskType::SendSms,
            TaskKind::MailchimpSubscribe(_) => TaskType::MailchimpSubscribe,
            TaskKind::CreateNotification(_) => TaskType::CreateNotification,
            TaskKind::ChargePaymentPlans(_) => TaskType::ChargePaymentPlans,
            TaskKind::RefreshReceipts(_) => TaskType::RefreshReceipts,
            TaskKind::TagTrialledDidntSub(_) => TaskType::TagTrialledDidntSub,
            TaskKind::DispatchDueSms(_) => TaskType::DispatchDueSms,
        }
    }

    /// Occurrence of a recurring type for the given slot. `None` for one-off types.
    pub fn recurring(task_type: TaskType, scheduled_for: DateTime<Utc>) -> Option<TaskKind> {
        let payload = RecurringPayload { scheduled_for };
        match task_type {
            TaskType::ChargePaymentPlans => Some(TaskKind::ChargePaymentPlans(payload)),
            TaskType::RefreshReceipts => Some(TaskKind::RefreshReceipts(payload)),
            TaskType::TagTrialledDidntSub => Some(TaskKind::TagTrialledDidntSub(payload)),
            TaskType::DispatchDueSms => Some(TaskKind::DispatchDueSms(payload)),
            TaskType::SendSms | TaskType::MailchimpSubscribe | TaskType::CreateNotification => {
                None
            }
        }
    }

    /// Slot of a recurring occurrence.
    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        match self {
            TaskKind::ChargePaymentPlans(p)
            | TaskKind::RefreshReceipts(p)
            | TaskKind::TagTrialledDidntSub(p)
            | TaskKind::DispatchDueSms(p) => Some(p.scheduled_for),
            TaskKind::SendSms(_)
            | TaskKind::MailchimpSubscribe(_)
            | TaskKind::CreateNotification(_) => None,
        }
    }

    /// Decode a stored `(task_type, payload)` pair, running each payload's
    /// semantic validation.
    pub fn from_parts(task_type: &str, payload: &serde_json::Value) -> Result<Self, PayloadError> {
        let task_type: TaskType = task_type.parse()?;
        let kind = match task_type {
            TaskType::SendSms => TaskKind::SendSms(decode(task_type, payload)?),
            TaskType::MailchimpSubscribe => {
                TaskKind::MailchimpSubscribe(decode(task_type, payload)?)
            }
            TaskType::CreateNotification => {
                TaskKind::CreateNotification(decode(task_type, payload)?)
            }
            TaskType::ChargePaymentPlans => {
                TaskKind::ChargePaymentPlans(decode(task_type, payload)?)
            }
            TaskType::RefreshReceipts => TaskKind::RefreshReceipts(decode(task_type, payload)?),
            TaskType::TagTrialledDidntSub => {
                TaskKind::TagTrialledDidntSub(decode(task_type, payload)?)
            }
            TaskType::DispatchDueSms => TaskKind::DispatchDueSms(decode(task_type, payload)?),
        };
        Ok(kind)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let result = match self {
            TaskKind::SendSms(p) => p.validate(),
            TaskKind::MailchimpSubscribe(p) => p.validate(),
            TaskKind::CreateNotification(p) => p.validate(),
            TaskKind::ChargePaymentPlans(p)
            | TaskKind::RefreshReceipts(p)
            | TaskKind::TagTrialledDidntSub(p)
            | TaskKind::DispatchDueSms(p) => p.validate(),
        };
        result.map_err(|reason| PayloadError::Invalid {
            task_type: self.task_type(),
            reason,
        })
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            TaskKind::SendSms(p) => serde_json::to_value(p),
            TaskKind::MailchimpSubscribe(p) => serde_json::to_value(p),
            TaskKind::CreateNotification(p) => serde_json::to_value(p),
            TaskKind::ChargePaymentPlans(p)
            | TaskKind::RefreshReceipts(p)
            | TaskKind::TagTrialledDidntSub(p)
            | TaskKind::DispatchDueSms(p) => serde_json::to_value(p),
        }
    }
}

fn decode<P: TaskPayload>(task_type: TaskType, payload: &serde_json::Value) -> Result<P, PayloadError> {
    let parsed: P = serde_json::from_value(payload.clone())
        .map_err(|source| PayloadError::Malformed { task_type, source })?;
    parsed
        .validate()
        .map_err(|reason| PayloadError::Invalid { task_type, reason })?;
    Ok(parsed)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub pending: i64,
    pub claimed: i64,
    pub done: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_task_type_round_trips_through_tag() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.to_string().parse::<TaskType>().unwrap(), task_type);
        }
        assert_eq!(TaskType::MailchimpSubscribe.to_string(), "mailchimp.subscribe");
        assert!(matches!(
            "mailchimpSubscribe".parse::<TaskType>(),
            Err(PayloadError::UnknownType(_))
        ));
    }

    #[test]
    fn test_recurring_set_matches_cadence() {
        for task_type in TaskType::ALL {
            assert_eq!(
                TaskType::RECURRING.contains(&task_type),
                task_type.is_recurring(),
                "{task_type}"
            );
        }
    }

    #[test]
    fn test_task_status_display_and_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Claimed,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Claimed.is_active());
        assert!(!TaskStatus::Failed.is_active());
    }

    #[test]
    fn test_from_parts_decodes_camel_case_payload() {
        let sms_id = Uuid::new_v4();
        let kind = TaskKind::from_parts("sendSms", &json!({ "smsId": sms_id })).unwrap();
        assert_eq!(kind, TaskKind::SendSms(SendSmsPayload { sms_id }));
        assert_eq!(kind.to_payload().unwrap(), json!({ "smsId": sms_id }));
    }

    #[test]
    fn test_from_parts_rejects_wrong_shape() {
        let err = TaskKind::from_parts("sendSms", &json!({ "sms": "x" })).unwrap_err();
        assert!(matches!(
            err,
            PayloadError::Malformed {
                task_type: TaskType::SendSms,
                ..
            }
        ));
    }

    #[test]
    fn test_from_parts_runs_semantic_validation() {
        let err = TaskKind::from_parts(
            "createNotification",
            &json!({ "trainerId": Uuid::new_v4(), "title": " ", "body": "x" }),
        )
        .unwrap_err();
        assert!(matches!(err, PayloadError::Invalid { .. }));
    }

    #[test]
    fn test_recurring_kind_carries_slot() {
        let slot = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let kind = TaskKind::recurring(TaskType::ChargePaymentPlans, slot).unwrap();
        assert_eq!(kind.scheduled_for(), Some(slot));
        assert_eq!(
            kind.to_payload().unwrap(),
            json!({ "scheduledFor": "2024-01-02T00:00:00Z" })
        );
        assert!(TaskKind::recurring(TaskType::SendSms, slot).is_none());
    }
}
