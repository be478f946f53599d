//! Configuration module
//!
//! Everything is read from the environment (a `.env` file is loaded first when
//! present). Unset or unparsable optional values fall back to the defaults below.

use std::env;
use std::str::FromStr;

use crate::backoff::{DEFAULT_RETRY_BASE_SECS, DEFAULT_RETRY_MAX_SECS};

const MAX_CONNECTIONS: u32 = 10;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const DISPATCHER_MAX_WORKERS: usize = 4;
const DISPATCHER_POLL_INTERVAL_MS: u64 = 1000;
const TASK_TIMEOUT_SECS: u64 = 120;
const STALE_CLAIM_SECS: u64 = 600;
const STALE_REAP_INTERVAL_SECS: u64 = 60;
const SHUTDOWN_GRACE_SECS: u64 = 30;
const TASK_RETENTION_DAYS: i32 = 30;
const RETENTION_SWEEP_INTERVAL_SECS: u64 = 3600;
const PROVIDER_TIMEOUT_SECS: u64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("Invalid LOG_FORMAT: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub environment: String,
    pub log_format: LogFormat,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    /// Wake on `pg_notify` in addition to polling.
    pub listen_notify: bool,
    pub task_timeout_seconds: u64,
    /// A claim older than this is considered abandoned.
    pub stale_claim_seconds: u64,
    /// 0 disables the periodic sweep (the startup sweep still runs).
    pub stale_reap_interval_seconds: u64,
    pub retry_base_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

/// Credentials for outbound providers. A missing credential disables nothing at
/// startup; the handler that needs it fails its task as unrecoverable.
#[derive(Clone, Debug, Default)]
pub struct ProviderSettings {
    pub timeout_seconds: u64,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    pub mailchimp_api_key: Option<String>,
    pub mailchimp_list_id: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub app_store_shared_secret: Option<String>,
    pub app_store_sandbox: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub base: BaseConfig,
    pub database_url: String,
    pub dispatcher: DispatcherSettings,
    /// Finished tasks older than this are deleted. 0 disables retention.
    pub task_retention_days: i32,
    pub retention_sweep_interval_seconds: u64,
    pub providers: ProviderSettings,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => raw.parse()?,
            Err(_) => LogFormat::Pretty,
        };

        let config = Config {
            base: BaseConfig {
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                log_format,
                db_max_connections: parse_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
                db_timeout_seconds: parse_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            },
            database_url,
            dispatcher: DispatcherSettings {
                max_workers: parse_or("DISPATCHER_MAX_WORKERS", DISPATCHER_MAX_WORKERS),
                poll_interval_ms: parse_or("DISPATCHER_POLL_INTERVAL_MS", DISPATCHER_POLL_INTERVAL_MS),
                listen_notify: parse_or("DISPATCHER_LISTEN_NOTIFY", true),
                task_timeout_seconds: parse_or("TASK_TIMEOUT_SECONDS", TASK_TIMEOUT_SECS),
                stale_claim_seconds: parse_or("STALE_CLAIM_SECONDS", STALE_CLAIM_SECS),
                stale_reap_interval_seconds: parse_or(
                    "STALE_REAP_INTERVAL_SECONDS",
                    STALE_REAP_INTERVAL_SECS,
                ),
                retry_base_delay_seconds: parse_or(
                    "RETRY_BASE_DELAY_SECONDS",
                    DEFAULT_RETRY_BASE_SECS,
                ),
                retry_max_delay_seconds: parse_or("RETRY_MAX_DELAY_SECONDS", DEFAULT_RETRY_MAX_SECS),
                shutdown_grace_seconds: parse_or("SHUTDOWN_GRACE_SECONDS", SHUTDOWN_GRACE_SECS),
            },
            task_retention_days: parse_or("TASK_RETENTION_DAYS", TASK_RETENTION_DAYS),
            retention_sweep_interval_seconds: parse_or(
                "RETENTION_SWEEP_INTERVAL_SECONDS",
                RETENTION_SWEEP_INTERVAL_SECS,
            ),
            providers: ProviderSettings {
                timeout_seconds: parse_or("PROVIDER_TIMEOUT_SECONDS", PROVIDER_TIMEOUT_SECS),
                twilio_account_sid: optional("TWILIO_ACCOUNT_SID"),
                twilio_auth_token: optional("TWILIO_AUTH_TOKEN"),
                twilio_from_number: optional("TWILIO_FROM_NUMBER"),
                mailchimp_api_key: optional("MAILCHIMP_API_KEY"),
                mailchimp_list_id: optional("MAILCHIMP_LIST_ID"),
                stripe_secret_key: optional("STRIPE_SECRET_KEY"),
                app_store_shared_secret: optional("APP_STORE_SHARED_SECRET"),
                app_store_sandbox: parse_or("APP_STORE_SANDBOX", false),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let d = &self.dispatcher;
        if d.max_workers == 0 {
            anyhow::bail!("DISPATCHER_MAX_WORKERS must be greater than 0");
        }
        if d.poll_interval_ms == 0 {
            anyhow::bail!("DISPATCHER_POLL_INTERVAL_MS must be greater than 0");
        }
        if d.task_timeout_seconds == 0 {
            anyhow::bail!("TASK_TIMEOUT_SECONDS must be greater than 0");
        }
        // A live claim must never look stale while its handler can still run.
        if d.stale_claim_seconds <= d.task_timeout_seconds {
            anyhow::bail!(
                "STALE_CLAIM_SECONDS ({}) must be greater than TASK_TIMEOUT_SECONDS ({})",
                d.stale_claim_seconds,
                d.task_timeout_seconds
            );
        }
        if d.retry_base_delay_seconds > d.retry_max_delay_seconds {
            anyhow::bail!("RETRY_BASE_DELAY_SECONDS must not exceed RETRY_MAX_DELAY_SECONDS");
        }
        if self.task_retention_days < 0 {
            anyhow::bail!("TASK_RETENTION_DAYS must not be negative");
        }
        if self.base.db_max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.base.environment.eq_ignore_ascii_case("production")
    }
}
