//! taskrelay core library
//!
//! Domain models, the task store contract, enqueue validation, recurring cadence
//! arithmetic, retry backoff and configuration shared by every taskrelay crate.

pub mod backoff;
pub mod cadence;
pub mod config;
pub mod enqueue;
pub mod models;
pub mod store;
pub mod task_error;

pub use backoff::RetryBackoff;
pub use cadence::{slot_dedupe_key, Cadence, SlotTime};
pub use config::{BaseConfig, Config, DispatcherSettings, LogFormat, ProviderSettings};
pub use enqueue::{EnqueueError, EnqueueOptions, NewTask, TaskHandle};
pub use store::{ReclaimOutcome, TaskStore};
pub use task_error::{is_unrecoverable, TaskError, TaskResultExt};
