//! taskrelay application
//!
//! Task handlers for every task type, the dispatch table that routes decoded
//! tasks to them, and process setup.

pub mod setup;
pub mod state;
mod task_dispatch;
pub mod task_handlers;

#[cfg(test)]
mod test_helpers;

pub use setup::{initialize_app, App};
pub use state::AppState;
pub use task_handlers::TaskHandler;
