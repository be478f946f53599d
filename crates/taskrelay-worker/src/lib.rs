//! taskrelay worker
//!
//! The dispatcher loop that claims and runs tasks, the stale-claim reaper, the
//! recurring scheduler and the handler seam the application plugs into.

pub mod context;
pub mod dispatcher;
pub mod memory;
pub mod scheduler;

pub use context::TaskHandlerContext;
pub use dispatcher::{default_worker_id, DispatcherConfig, TaskDispatcher};
pub use memory::MemoryTaskStore;
pub use scheduler::{RecurringScheduler, ScheduleError};
