//! PostgreSQL persistence for taskrelay.
//!
//! [`TaskRepository`] is the durable task store. [`enqueue`] is the
//! transaction-aware insert application code calls on its own transaction so
//! the task commits or rolls back together with the business write.

pub mod db;

pub use db::billing::{BillingRepository, PgBillingRepository};
pub use db::sms::{PgSmsRepository, SmsRepository};
pub use db::task::{enqueue, TaskRepository, TASK_NOTIFY_CHANNEL};
pub use db::trainer::{PgTrainerRepository, TrainerRepository};
pub use db::{connect, run_migrations};
