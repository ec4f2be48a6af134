//! Execution engine: the workflow runtime and the per-replica poll scheduler

mod runtime;
mod scheduler;

pub use runtime::{RuntimeConfig, WorkflowRuntime};
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerHandle};
