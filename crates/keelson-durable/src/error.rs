//! Crate-level error taxonomy
//!
//! Lease contention is deliberately absent: losing a lease race is routine,
//! handled by retrying on the next poll tick, and never surfaced to
//! application code.

use std::time::Duration;

use crate::workflow::WorkflowError;

/// Errors surfaced to application code
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// Malformed input or registration parameters
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown workflow id or cron job name
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed cron expression
    #[error("invalid cron schedule: {0}")]
    InvalidSchedule(#[from] crate::cron::CronParseError),

    /// `result()` exceeded its wait budget; the execution itself is
    /// unaffected and keeps running
    #[error("timed out after {waited:?} waiting for a terminal status")]
    Timeout { waited: Duration },

    /// The execution failed; the step failure is recorded on the row
    #[error("execution failed: {0}")]
    ExecutionFailed(WorkflowError),

    /// The execution was cancelled before producing a result
    #[error("execution was cancelled")]
    ExecutionCancelled,

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
