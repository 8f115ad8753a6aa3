//! Misc utilities.

mod checkpoint;
mod early_stop;
mod lr_scheduler;
mod rate_counter;

pub use checkpoint::*;
pub use early_stop::*;
pub use lr_scheduler::*;
pub use rate_counter::*;
