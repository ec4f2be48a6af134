//! Workflow definitions, handler context, and client handles

mod context;
mod definition;
mod handle;
mod registry;

pub use context::{ChildStarter, StepError, Suspension, WorkflowContext};
pub use definition::{Workflow, WorkflowError};
pub use handle::ExecutionHandle;
pub use registry::WorkflowRegistry;
