use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use taskrelay_core::ProviderSettings;

use super::{http_client, ProviderError};

const PROVIDER: &str = "stripe";
const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// An off-session charge against a saved payment method.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Sent as `Idempotency-Key`, so a retried charge is never taken twice.
    pub idempotency_key: String,
    pub description: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Returns the provider charge id.
    async fn charge(&self, request: &ChargeRequest) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: Option<String>,
}

impl StripeClient {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(settings.timeout_seconds)?,
            base_url: STRIPE_API_BASE.to_string(),
            secret_key: settings.stripe_secret_key.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: StripeError,
}

#[derive(Debug, Default, Deserialize)]
struct StripeError {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

fn classify(status: StatusCode, error: StripeError) -> ProviderError {
    let message = error
        .message
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    let code = error.decline_code.or(error.code);
    if status == StatusCode::PAYMENT_REQUIRED || error.kind.as_deref() == Some("card_error") {
        return ProviderError::Rejected {
            provider: PROVIDER,
            code: code.unwrap_or_else(|| "card_declined".to_string()),
            message,
        };
    }
    ProviderError::from_status(PROVIDER, status, code, message)
}

/// A created intent is only a payment once it has succeeded or is settling.
fn settle(intent: PaymentIntent) -> Result<String, ProviderError> {
    match intent.status.as_str() {
        "succeeded" | "processing" => Ok(intent.id),
        other => Err(ProviderError::Rejected {
            provider: PROVIDER,
            code: other.to_string(),
            message: format!("payment intent {} ended in status {}", intent.id, other),
        }),
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    #[tracing::instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    async fn charge(&self, request: &ChargeRequest) -> Result<String, ProviderError> {
        let key = self
            .secret_key
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "STRIPE_SECRET_KEY"))?;

        let amount = request.amount_cents.to_string();
        let currency = request.currency.to_lowercase();
        let mut form = vec![
            ("amount", amount.as_str()),
            ("currency", currency.as_str()),
            ("customer", request.customer_id.as_str()),
            ("payment_method", request.payment_method_id.as_str()),
            ("off_session", "true"),
            ("confirm", "true"),
        ];
        if let Some(description) = request.description.as_deref() {
            form.push(("description", description));
        }

        let response = self
            .http
            .post(format!("{}/payment_intents", self.base_url))
            .bearer_auth(key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;

        let status = response.status();
        if status.is_success() {
            let intent: PaymentIntent = response
                .json()
                .await
                .map_err(|e| ProviderError::transport(PROVIDER, e))?;
            return settle(intent);
        }

        let envelope: ErrorEnvelope = response.json().await.unwrap_or_default();
        Err(classify(status, envelope.error))
    }
}
