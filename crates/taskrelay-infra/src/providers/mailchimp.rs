use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use taskrelay_core::ProviderSettings;

use super::{http_client, ProviderError};

const PROVIDER: &str = "mailchimp";

/// Mailchimp error titles that will not change on retry.
const PERMANENT_TITLES: [&str; 3] = [
    "Invalid Resource",
    "Member In Compliance State",
    "Forgotten Email Not Subscribed",
];

#[async_trait]
pub trait MailingList: Send + Sync {
    /// Add or update a list member as subscribed.
    async fn subscribe(&self, email: &str, first_name: Option<&str>) -> Result<(), ProviderError>;

    /// Attach an active tag to an existing member.
    async fn add_tag(&self, email: &str, tag: &str) -> Result<(), ProviderError>;
}

#[derive(Clone)]
pub struct MailchimpClient {
    http: reqwest::Client,
    api_key: Option<String>,
    list_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    title: Option<String>,
    detail: Option<String>,
}

/// Keys look like `<secret>-us21`; the suffix names the API host.
fn api_base(api_key: &str) -> Result<String, ProviderError> {
    match api_key.rsplit_once('-') {
        Some((_, dc)) if !dc.is_empty() => Ok(format!("https://{}.api.mailchimp.com/3.0", dc)),
        _ => Err(ProviderError::Misconfigured {
            provider: PROVIDER,
            message: "API key has no data center suffix".to_string(),
        }),
    }
}

fn member_url(base: &str, list_id: &str, email: &str, tail: &[&str]) -> Result<Url, ProviderError> {
    let mut url = Url::parse(base).map_err(|e| ProviderError::Misconfigured {
        provider: PROVIDER,
        message: e.to_string(),
    })?;
    let email = email.trim().to_lowercase();
    url.path_segments_mut()
        .map_err(|_| ProviderError::Misconfigured {
            provider: PROVIDER,
            message: "API base cannot hold a path".to_string(),
        })?
        .extend(["lists", list_id, "members", email.as_str()])
        .extend(tail);
    Ok(url)
}

fn classify(status: StatusCode, error: ErrorResponse) -> ProviderError {
    let message = error
        .detail
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    match error.title {
        Some(title) if PERMANENT_TITLES.contains(&title.as_str()) => ProviderError::Rejected {
            provider: PROVIDER,
            code: title,
            message,
        },
        title => ProviderError::from_status(PROVIDER, status, title, message),
    }
}

impl MailchimpClient {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(settings.timeout_seconds)?,
            api_key: settings.mailchimp_api_key.clone(),
            list_id: settings.mailchimp_list_id.clone(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str), ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "MAILCHIMP_API_KEY"))?;
        let list = self
            .list_id
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(PROVIDER, "MAILCHIMP_LIST_ID"))?;
        Ok((key, list))
    }

    async fn check(response: reqwest::Response) -> Result<(), ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let error: ErrorResponse = response.json().await.unwrap_or_default();
        Err(classify(status, error))
    }
}

#[async_trait]
impl MailingList for MailchimpClient {
    #[tracing::instrument(skip(self, first_name))]
    async fn subscribe(&self, email: &str, first_name: Option<&str>) -> Result<(), ProviderError> {
        let (key, list) = self.credentials()?;
        let url = member_url(&api_base(key)?, list, email, &[])?;
        let body = json!({
            "email_address": email,
            "status_if_new": "subscribed",
            "merge_fields": { "FNAME": first_name.unwrap_or_default() },
        });

        let response = self
            .http
            .put(url)
            .basic_auth("taskrelay", Some(key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;
        Self::check(response).await
    }

    #[tracing::instrument(skip(self))]
    async fn add_tag(&self, email: &str, tag: &str) -> Result<(), ProviderError> {
        let (key, list) = self.credentials()?;
        let url = member_url(&api_base(key)?, list, email, &["tags"])?;
        let body = json!({ "tags": [{ "name": tag, "status": "active" }] });

        let response = self
            .http
            .post(url)
            .basic_auth("taskrelay", Some(key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;
        Self::check(response).await
    }
}
