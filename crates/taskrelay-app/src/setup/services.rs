//! Repositories and provider clients

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;

use taskrelay_core::Config;
use taskrelay_db::{PgBillingRepository, PgSmsRepository, PgTrainerRepository};
use taskrelay_infra::{AppStoreClient, MailchimpClient, StripeClient, TwilioClient};

use crate::state::AppState;

/// Build the handler state from the pool and provider settings.
pub fn initialize_services(config: &Config, pool: &PgPool) -> Result<Arc<AppState>> {
    let providers = &config.providers;

    let twilio = TwilioClient::new(providers).context("Failed to build Twilio client")?;
    let mailchimp = MailchimpClient::new(providers).context("Failed to build Mailchimp client")?;
    let stripe = StripeClient::new(providers).context("Failed to build Stripe client")?;
    let app_store = AppStoreClient::new(providers).context("Failed to build App Store client")?;

    let configured = [
        ("twilio", providers.twilio_account_sid.is_some() && providers.twilio_auth_token.is_some()),
        ("mailchimp", providers.mailchimp_api_key.is_some() && providers.mailchimp_list_id.is_some()),
        ("stripe", providers.stripe_secret_key.is_some()),
        ("app_store", providers.app_store_shared_secret.is_some()),
    ];
    for (provider, ok) in configured {
        if !ok {
            tracing::warn!(provider, "Provider credentials missing; its tasks will fail");
        }
    }

    Ok(Arc::new(AppState {
        sms: Arc::new(PgSmsRepository::new(pool.clone())),
        trainers: Arc::new(PgTrainerRepository::new(pool.clone())),
        billing: Arc::new(PgBillingRepository::new(pool.clone())),
        sms_sender: Arc::new(twilio),
        mailing_list: Arc::new(mailchimp),
        payments: Arc::new(stripe),
        receipts: Arc::new(app_store),
    }))
}
