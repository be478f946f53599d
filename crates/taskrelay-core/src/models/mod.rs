pub mod billing;
pub mod sms;
pub mod task;
pub mod trainer;

pub use billing::*;
pub use sms::*;
pub use task::*;
pub use trainer::*;
