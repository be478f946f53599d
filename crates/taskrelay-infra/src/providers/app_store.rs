use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use taskrelay_core::ProviderSettings;

use super::{http_client, ProviderError};

const PROVIDER: &str = "app_store";
const PRODUCTION_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
const SANDBOX_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";

/// Sandbox receipt sent to the production endpoint.
const STATUS_SANDBOX_RECEIPT: i64 = 21007;

/// Latest known state of an auto-renewing subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    async fn verify(&self, receipt: &str) -> Result<ReceiptStatus, ProviderError>;
}

#[derive(Clone)]
pub struct AppStoreClient {
    http: reqwest::Client,
    shared_secret: Option<String>,
    sandbox: bool,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: i64,
    #[serde(default)]
    latest_receipt_info: Vec<ReceiptInfo>,
}

#[derive(Debug, Deserialize)]
struct ReceiptInfo {
    expires_date_ms: Option<String>,
}

fn classify_status(status: i64) -> Option<ProviderError> {
    let message = format!("verifyReceipt status {}", status);
    match status {
        0 | 21006 => None,
        21004 => Some(ProviderError::Misconfigured {
            provider: PROVIDER,
            message,
        }),
        21005 | 21009 | 21100..=21199 => Some(ProviderError::Transient {
            provider: PROVIDER,
            message,
        }),
        _ => Some(ProviderError::Rejected {
            provider: PROVIDER,
            code: status.to_string(),
            message,
        }),
    }
}

fn receipt_status(response: &VerifyResponse, now: DateTime<Utc>) -> ReceiptStatus {
    let expires_at = response
        .latest_receipt_info
        .iter()
        .filter_map(|info| info.expires_date_ms.as_deref()?.parse::<i64>().ok())
        .max()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    ReceiptStatus {
        expires_at,
        active: expires_at.map_or(false, |at| at > now),
    }
}

impl AppStoreClient {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(settings.timeout_seconds)?,
            shared_secret: settings.app_store_shared_secret.clone(),
            sandbox: settings.app_store_sandbox,
        })
    }

    async fn post(&self, url: &str, receipt: &str, secret: &str) -> Result<VerifyResponse, ProviderError> {
        let response = self
            .http
            .post(url)
            .json(&json!({
                "receipt-data": receipt,
                "password": secret,
                "exclude-old-transactions": true,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(
                PROVIDER,
                status,
                None,
                format!("verifyReceipt returned HTTP {}", status.as_u16()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))
    }
}

#[async_trait]
impl ReceiptVerifier for AppStoreClient {
    #[tracing::instrument(skip_all)]
    async fn verify(&self, receipt: &str) -> Result<ReceiptStatus, ProviderError> {
        let secret = self
            .shared_secret
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "APP_STORE_SHARED_SECRET"))?;

        let first_url = if self.sandbox { SANDBOX_URL } else { PRODUCTION_URL };
        let mut response = self.post(first_url, receipt, secret).await?;
        if response.status == STATUS_SANDBOX_RECEIPT && !self.sandbox {
            tracing::debug!("Sandbox receipt, retrying against sandbox endpoint");
            response = self.post(SANDBOX_URL, receipt, secret).await?;
        }

        if let Some(err) = classify_status(response.status) {
            return Err(err);
        }
        Ok(receipt_status(&response, Utc::now()))
    }
}
