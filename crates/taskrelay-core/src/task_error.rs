//! Handler error classification.
//!
//! Handlers return `anyhow::Result`. Wrapping the error in [`TaskError`] lets a
//! handler tell the dispatcher that retrying is pointless; any other error
//! consumes an attempt and goes through the normal backoff path.

use std::fmt;

#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl TaskError {
    /// The task is failed immediately, whatever attempts remain.
    ///
    /// For conditions a retry cannot change: the row the task points at is
    /// gone, credentials are missing, the payload refers to nothing.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// The task is retried while it has attempts left.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

pub trait TaskResultExt<T> {
    /// Mark the error side of this result as not worth retrying.
    fn unrecoverable(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, TaskError> {
        self.map_err(TaskError::unrecoverable)
    }
}

/// True when `err` carries a [`TaskError`] marked unrecoverable anywhere in its chain.
pub fn is_unrecoverable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<TaskError>())
        .any(|task_error| !task_error.is_recoverable())
}
