use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use taskrelay_core::ProviderSettings;

use super::{http_client, ProviderError};

const PROVIDER: &str = "twilio";
const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Twilio error codes that describe the recipient, not the request or the service.
const PERMANENT_RECIPIENT_CODES: [i64; 6] = [
    21211, // invalid 'To' number
    21217, // number does not appear valid
    21610, // recipient replied STOP
    21612, // 'To' number not reachable via this route
    21614, // 'To' number is not a mobile number
    30006, // landline or unreachable carrier
];

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Send a text message. Returns the provider message id.
    async fn send(&self, to: &str, body: &str) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct TwilioClient {
    http: reqwest::Client,
    base_url: String,
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
}

impl TwilioClient {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(settings.timeout_seconds)?,
            base_url: TWILIO_API_BASE.to_string(),
            account_sid: settings.twilio_account_sid.clone(),
            auth_token: settings.twilio_auth_token.clone(),
            from_number: settings.twilio_from_number.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    code: Option<i64>,
    message: Option<String>,
}

fn classify(status: StatusCode, error: ErrorResponse) -> ProviderError {
    let message = error
        .message
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    match error.code {
        Some(code) if PERMANENT_RECIPIENT_CODES.contains(&code) => ProviderError::Rejected {
            provider: PROVIDER,
            code: code.to_string(),
            message,
        },
        code => ProviderError::from_status(PROVIDER, status, code.map(|c| c.to_string()), message),
    }
}

#[async_trait]
impl SmsSender for TwilioClient {
    #[tracing::instrument(skip(self, body))]
    async fn send(&self, to: &str, body: &str) -> Result<String, ProviderError> {
        let sid = self
            .account_sid
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "TWILIO_ACCOUNT_SID"))?;
        let token = self
            .auth_token
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "TWILIO_AUTH_TOKEN"))?;
        let from = self
            .from_number
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "TWILIO_FROM_NUMBER"))?;

        let response = self
            .http
            .post(format!("{}/Accounts/{}/Messages.json", self.base_url, sid))
            .basic_auth(sid, Some(token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;

        let status = response.status();
        if status.is_success() {
            let message: MessageResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::transport(PROVIDER, e))?;
            tracing::debug!(provider_sid = %message.sid, "SMS accepted by provider");
            return Ok(message.sid);
        }

        let error: ErrorResponse = response.json().await.unwrap_or_default();
        Err(classify(status, error))
    }
}
