use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanFrequency {
    Weekly,
    Fortnightly,
    Monthly,
}

impl PlanFrequency {
    /// Due date following `due_at`. Month arithmetic clamps to the last day of
    /// shorter months.
    pub fn advance(&self, due_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            PlanFrequency::Weekly => due_at.checked_add_signed(chrono::Duration::days(7)),
            PlanFrequency::Fortnightly => due_at.checked_add_signed(chrono::Duration::days(14)),
            PlanFrequency::Monthly => due_at.checked_add_months(Months::new(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentPlan {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub client_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_payment_method_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub frequency: PlanFrequency,
    pub next_payment_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl PaymentPlan {
    /// Stripe idempotency key for one due installment.
    pub fn idempotency_key(&self) -> String {
        format!(
            "plan:{}:{}",
            self.id,
            self.next_payment_at
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PaymentOutcome {
    Paid { charge_id: String },
    Declined { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppStoreSubscription {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub latest_receipt: String,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}
