//! Infrastructure for taskrelay: telemetry setup and the HTTP clients handlers
//! use to reach external providers.

pub mod providers;
pub mod telemetry;

pub use providers::{
    AppStoreClient, ChargeRequest, MailchimpClient, MailingList, PaymentGateway, ProviderError,
    ReceiptStatus, ReceiptVerifier, SmsSender, StripeClient, TwilioClient,
};
pub use telemetry::init_telemetry;
