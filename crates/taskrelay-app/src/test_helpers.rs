//! In-memory repositories and provider doubles for handler tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use taskrelay_core::models::{
    AppStoreSubscription, MailingListStatus, NewNotification, PaymentOutcome, PaymentPlan,
    PlanFrequency, SmsMessage, SmsStatus, Task, TaskStatus, Trainer,
};
use taskrelay_core::NewTask;
use taskrelay_db::{BillingRepository, SmsRepository, TrainerRepository};
use taskrelay_infra::{
    ChargeRequest, MailingList, PaymentGateway, ProviderError, ReceiptStatus, ReceiptVerifier,
    SmsSender,
};

use crate::state::AppState;

#[derive(Default)]
pub struct MockSmsRepository {
    pub messages: Mutex<HashMap<Uuid, SmsMessage>>,
    pub follow_ups: Mutex<Vec<NewTask>>,
    pub due: Mutex<Vec<Uuid>>,
}

impl MockSmsRepository {
    pub fn insert(&self, status: SmsStatus) -> SmsMessage {
        let sms = SmsMessage {
            id: Uuid::new_v4(),
            trainer_id: Uuid::new_v4(),
            to_number: "+61400000000".to_string(),
            body: "Session tomorrow at 7am".to_string(),
            status,
            send_at: Utc::now(),
            provider_sid: None,
            failure_reason: None,
        };
        self.messages.lock().unwrap().insert(sms.id, sms.clone());
        sms
    }

    pub fn status(&self, id: Uuid) -> Option<SmsStatus> {
        self.messages.lock().unwrap().get(&id).map(|m| m.status)
    }
}

#[async_trait]
impl SmsRepository for MockSmsRepository {
    async fn get(&self, sms_id: Uuid) -> Result<Option<SmsMessage>> {
        Ok(self.messages.lock().unwrap().get(&sms_id).cloned())
    }

    async fn mark_sent(&self, sms_id: Uuid, provider_sid: &str) -> Result<()> {
        if let Some(sms) = self.messages.lock().unwrap().get_mut(&sms_id) {
            sms.status = SmsStatus::Sent;
            sms.provider_sid = Some(provider_sid.to_string());
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        sms_id: Uuid,
        reason: &str,
        follow_up: Option<NewTask>,
    ) -> Result<()> {
        if let Some(sms) = self.messages.lock().unwrap().get_mut(&sms_id) {
            sms.status = SmsStatus::Failed;
            sms.failure_reason = Some(reason.to_string());
        }
        self.follow_ups.lock().unwrap().extend(follow_up);
        Ok(())
    }

    async fn queue_due(&self, _now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        let mut due = self.due.lock().unwrap();
        let take = due.len().min(limit.max(0) as usize);
        Ok(due.drain(..take).collect())
    }
}

#[derive(Default)]
pub struct MockTrainerRepository {
    pub trainers: Mutex<HashMap<Uuid, Trainer>>,
    pub notifications: Mutex<Vec<NewNotification>>,
}

impl MockTrainerRepository {
    pub fn insert(&self, email: &str) -> Trainer {
        let trainer = Trainer {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: Some("Sam".to_string()),
            trial_ends_at: Some(Utc::now() - chrono::Duration::days(1)),
            has_subscription: false,
            mailing_list_status: None,
            trial_tagged_at: None,
        };
        self.trainers
            .lock()
            .unwrap()
            .insert(trainer.id, trainer.clone());
        trainer
    }

    pub fn trainer(&self, id: Uuid) -> Option<Trainer> {
        self.trainers.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl TrainerRepository for MockTrainerRepository {
    async fn get(&self, trainer_id: Uuid) -> Result<Option<Trainer>> {
        Ok(self.trainer(trainer_id))
    }

    async fn set_mailing_list_status(
        &self,
        trainer_id: Uuid,
        status: MailingListStatus,
    ) -> Result<()> {
        if let Some(trainer) = self.trainers.lock().unwrap().get_mut(&trainer_id) {
            trainer.mailing_list_status = Some(status);
        }
        Ok(())
    }

    async fn trialled_didnt_subscribe(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Trainer>> {
        Ok(self
            .trainers
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                !t.has_subscription
                    && t.trial_tagged_at.is_none()
                    && t.trial_ends_at.map_or(false, |ends| ends <= as_of)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_trial_tagged(&self, trainer_id: Uuid) -> Result<()> {
        if let Some(trainer) = self.trainers.lock().unwrap().get_mut(&trainer_id) {
            trainer.trial_tagged_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn insert_notification(&self, notification: &NewNotification) -> Result<bool> {
        let mut notifications = self.notifications.lock().unwrap();
        if notifications
            .iter()
            .any(|n| n.source_task_id == notification.source_task_id)
        {
            return Ok(false);
        }
        notifications.push(notification.clone());
        Ok(true)
    }
}

#[derive(Default)]
pub struct MockBillingRepository {
    pub plans: Mutex<Vec<PaymentPlan>>,
    pub payments: Mutex<Vec<(Uuid, DateTime<Utc>, PaymentOutcome)>>,
    pub follow_ups: Mutex<Vec<NewTask>>,
    pub subscriptions: Mutex<HashMap<Uuid, AppStoreSubscription>>,
}

impl MockBillingRepository {
    pub fn insert_plan(&self, due_at: DateTime<Utc>) -> PaymentPlan {
        let plan = PaymentPlan {
            id: Uuid::new_v4(),
            trainer_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            stripe_customer_id: "cus_123".to_string(),
            stripe_payment_method_id: "pm_123".to_string(),
            amount_cents: 4500,
            currency: "AUD".to_string(),
            frequency: PlanFrequency::Weekly,
            next_payment_at: due_at,
            ends_at: None,
        };
        self.plans.lock().unwrap().push(plan.clone());
        plan
    }

    pub fn insert_subscription(&self, expires_at: DateTime<Utc>) -> AppStoreSubscription {
        let subscription = AppStoreSubscription {
            id: Uuid::new_v4(),
            trainer_id: Uuid::new_v4(),
            latest_receipt: "MIIT...receipt".to_string(),
            expires_at,
            active: true,
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id, subscription.clone());
        subscription
    }
}

#[async_trait]
impl BillingRepository for MockBillingRepository {
    async fn due_payment_plans(&self, as_of: DateTime<Utc>, limit: i64) -> Result<Vec<PaymentPlan>> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.next_payment_at <= as_of)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_payment(
        &self,
        plan: &PaymentPlan,
        outcome: &PaymentOutcome,
        follow_up: Option<NewTask>,
    ) -> Result<()> {
        let mut payments = self.payments.lock().unwrap();
        if payments
            .iter()
            .any(|(id, due, _)| *id == plan.id && *due == plan.next_payment_at)
        {
            return Ok(());
        }
        payments.push((plan.id, plan.next_payment_at, outcome.clone()));

        let mut plans = self.plans.lock().unwrap();
        if let Some(stored) = plans
            .iter_mut()
            .find(|p| p.id == plan.id && p.next_payment_at == plan.next_payment_at)
        {
            if let Some(next) = stored.frequency.advance(stored.next_payment_at) {
                stored.next_payment_at = next;
            }
        }
        self.follow_ups.lock().unwrap().extend(follow_up);
        Ok(())
    }

    async fn expiring_subscriptions(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AppStoreSubscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.active && s.expires_at <= before)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        expires_at: DateTime<Utc>,
        active: bool,
    ) -> Result<()> {
        if let Some(subscription) = self
            .subscriptions
            .lock()
            .unwrap()
            .get_mut(&subscription_id)
        {
            subscription.expires_at = expires_at;
            subscription.active = active;
        }
        Ok(())
    }
}

/// Provider double: replays queued errors, otherwise succeeds.
#[derive(Default)]
pub struct MockProviders {
    pub errors: Mutex<VecDeque<ProviderError>>,
    pub sms_sent: Mutex<Vec<(String, String)>>,
    pub subscribed: Mutex<Vec<String>>,
    pub tagged: Mutex<Vec<(String, String)>>,
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub receipt: Mutex<Option<ReceiptStatus>>,
}

impl MockProviders {
    pub fn fail_next(&self, err: ProviderError) {
        self.errors.lock().unwrap().push_back(err);
    }

    fn next_error(&self) -> Option<ProviderError> {
        self.errors.lock().unwrap().pop_front()
    }
}

pub fn rejected(code: &str) -> ProviderError {
    ProviderError::Rejected {
        provider: "mock",
        code: code.to_string(),
        message: format!("rejected with {}", code),
    }
}

pub fn transient() -> ProviderError {
    ProviderError::Transient {
        provider: "mock",
        message: "503 Service Unavailable".to_string(),
    }
}

#[async_trait]
impl SmsSender for MockProviders {
    async fn send(&self, to: &str, body: &str) -> Result<String, ProviderError> {
        if let Some(err) = self.next_error() {
            return Err(err);
        }
        let mut sent = self.sms_sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(format!("SM{}", sent.len()))
    }
}

#[async_trait]
impl MailingList for MockProviders {
    async fn subscribe(&self, email: &str, _first_name: Option<&str>) -> Result<(), ProviderError> {
        if let Some(err) = self.next_error() {
            return Err(err);
        }
        self.subscribed.lock().unwrap().push(email.to_string());
        Ok(())
    }

    async fn add_tag(&self, email: &str, tag: &str) -> Result<(), ProviderError> {
        if let Some(err) = self.next_error() {
            return Err(err);
        }
        self.tagged
            .lock()
            .unwrap()
            .push((email.to_string(), tag.to_string()));
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockProviders {
    async fn charge(&self, request: &ChargeRequest) -> Result<String, ProviderError> {
        if let Some(err) = self.next_error() {
            return Err(err);
        }
        let mut charges = self.charges.lock().unwrap();
        charges.push(request.clone());
        Ok(format!("pi_{}", charges.len()))
    }
}

#[async_trait]
impl ReceiptVerifier for MockProviders {
    async fn verify(&self, _receipt: &str) -> Result<ReceiptStatus, ProviderError> {
        if let Some(err) = self.next_error() {
            return Err(err);
        }
        Ok(self.receipt.lock().unwrap().unwrap_or(ReceiptStatus {
            expires_at: None,
            active: false,
        }))
    }
}

pub struct TestContext {
    pub sms: Arc<MockSmsRepository>,
    pub trainers: Arc<MockTrainerRepository>,
    pub billing: Arc<MockBillingRepository>,
    pub providers: Arc<MockProviders>,
    pub state: Arc<AppState>,
}

impl TestContext {
    pub fn new() -> Self {
        let sms = Arc::new(MockSmsRepository::default());
        let trainers = Arc::new(MockTrainerRepository::default());
        let billing = Arc::new(MockBillingRepository::default());
        let providers = Arc::new(MockProviders::default());
        let state = Arc::new(AppState {
            sms: sms.clone(),
            trainers: trainers.clone(),
            billing: billing.clone(),
            sms_sender: providers.clone(),
            mailing_list: providers.clone(),
            payments: providers.clone(),
            receipts: providers.clone(),
        });
        Self {
            sms,
            trainers,
            billing,
            providers,
            state,
        }
    }
}

/// A claimed task row for handlers that look at the task itself.
pub fn claimed_task(task_type: &str) -> Task {
    let now = Utc::now();
    Task {
        id: Uuid::new_v4(),
        task_type: task_type.to_string(),
        payload: serde_json::json!({}),
        dedupe_key: None,
        status: TaskStatus::Claimed,
        attempts: 1,
        max_attempts: 3,
        available_at: now,
        last_error: None,
        result: None,
        claimed_by: Some("test".to_string()),
        created_at: now,
        claimed_at: Some(now),
        completed_at: None,
        updated_at: now,
    }
}
