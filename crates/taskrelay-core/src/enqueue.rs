//! Enqueue request building and validation.
//!
//! A [`NewTask`] can only be built from a payload that decodes and validates for
//! its task type, so every store implementation inserts well-formed work.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{PayloadError, TaskKind, TaskType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Earliest claim time. Defaults to the store's current time.
    pub available_at: Option<DateTime<Utc>>,
    /// Makes the enqueue a no-op while an active row holds the same key.
    pub dedupe_key: Option<String>,
    /// Defaults to [`TaskType::default_max_attempts`].
    pub max_attempts: Option<i32>,
}

impl EnqueueOptions {
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A validated insert, ready for any [`crate::TaskStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub available_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl NewTask {
    pub fn new(kind: TaskKind, options: EnqueueOptions) -> Result<Self, EnqueueError> {
        kind.validate()?;
        let task_type = kind.task_type();
        let max_attempts = options
            .max_attempts
            .unwrap_or_else(|| task_type.default_max_attempts());
        if max_attempts < 1 {
            return Err(EnqueueError::InvalidMaxAttempts(max_attempts));
        }
        if let Some(key) = &options.dedupe_key {
            if key.trim().is_empty() {
                return Err(EnqueueError::EmptyDedupeKey);
            }
        }
        let payload = kind.to_payload().map_err(EnqueueError::Serialize)?;

        Ok(Self {
            task_type,
            payload,
            dedupe_key: options.dedupe_key,
            available_at: options.available_at,
            max_attempts,
        })
    }

    /// Build from an untyped tag and JSON payload, checking the payload against
    /// the schema of `task_type`.
    pub fn from_raw(
        task_type: &str,
        payload: &serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Self, EnqueueError> {
        let kind = TaskKind::from_parts(task_type, payload)?;
        Self::new(kind, options)
    }
}

/// Identity of the row an enqueue resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub id: Uuid,
    /// True when an active row with the same dedupe key already existed and
    /// nothing was inserted.
    pub deduplicated: bool,
}

impl TaskHandle {
    pub fn inserted(id: Uuid) -> Self {
        Self {
            id,
            deduplicated: false,
        }
    }

    pub fn existing(id: Uuid) -> Self {
        Self {
            id,
            deduplicated: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),
    #[error("dedupe key must not be blank")]
    EmptyDedupeKey,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
