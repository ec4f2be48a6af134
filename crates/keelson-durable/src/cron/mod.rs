//! Distributed cron: schedule parsing and the lease-guarded job runtime

mod runtime;
mod schedule;

pub use runtime::{CronConfig, CronHandle, CronRuntime};
pub use schedule::{CronParseError, Schedule};
