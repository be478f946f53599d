//! Outbound provider clients.
//!
//! Each provider sits behind a small trait so handlers can be exercised with
//! in-memory doubles. Failures are reported as [`ProviderError`], which keeps
//! the distinction handlers care about: retry, resolve locally, or give up.

mod app_store;
mod mailchimp;
mod stripe;
mod twilio;

pub use app_store::{AppStoreClient, ReceiptStatus, ReceiptVerifier};
pub use mailchimp::{MailchimpClient, MailingList};
pub use stripe::{ChargeRequest, PaymentGateway, StripeClient};
pub use twilio::{SmsSender, TwilioClient};

use anyhow::Context;
use reqwest::StatusCode;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network failure, rate limiting or a provider outage.
    #[error("{provider} transient failure: {message}")]
    Transient {
        provider: &'static str,
        message: String,
    },
    /// The provider refused this particular request.
    #[error("{provider} rejected request ({code}): {message}")]
    Rejected {
        provider: &'static str,
        code: String,
        message: String,
    },
    /// Missing or refused credentials. Affects every request until fixed.
    #[error("{provider} is misconfigured: {message}")]
    Misconfigured {
        provider: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub(crate) fn transport(provider: &'static str, err: reqwest::Error) -> Self {
        ProviderError::Transient {
            provider,
            message: err.to_string(),
        }
    }

    pub(crate) fn not_configured(provider: &'static str, what: &str) -> Self {
        ProviderError::Misconfigured {
            provider,
            message: format!("{} is not set", what),
        }
    }

    /// Classification by HTTP status alone, for responses without a more
    /// specific provider error code.
    pub(crate) fn from_status(
        provider: &'static str,
        status: StatusCode,
        code: Option<String>,
        message: String,
    ) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::Misconfigured { provider, message }
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                ProviderError::Transient { provider, message }
            }
            s if s.is_server_error() => ProviderError::Transient { provider, message },
            s => ProviderError::Rejected {
                provider,
                code: code.unwrap_or_else(|| s.as_u16().to_string()),
                message,
            },
        }
    }
}

pub(crate) fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("taskrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}
