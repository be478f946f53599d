use std::sync::Arc;

use taskrelay_db::{BillingRepository, SmsRepository, TrainerRepository};
use taskrelay_infra::{MailingList, PaymentGateway, ReceiptVerifier, SmsSender};

/// Everything a task handler may touch: business repositories and provider clients.
#[derive(Clone)]
pub struct AppState {
    pub sms: Arc<dyn SmsRepository>,
    pub trainers: Arc<dyn TrainerRepository>,
    pub billing: Arc<dyn BillingRepository>,
    pub sms_sender: Arc<dyn SmsSender>,
    pub mailing_list: Arc<dyn MailingList>,
    pub payments: Arc<dyn PaymentGateway>,
    pub receipts: Arc<dyn ReceiptVerifier>,
}
