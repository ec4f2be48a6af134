//! DurableStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowError;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Cron job not found
    #[error("cron job not found: {0}")]
    CronJobNotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Execution status
///
/// `Completed`, `Failed` and `Cancelled` are terminal; a sleeping execution
/// with no wake time is waiting for a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Handler is being replayed by some replica
    Running,

    /// Suspended until `wake_at` passes (or a signal arrives when `wake_at` is unset)
    Sleeping,

    /// Cancellation requested, not yet observed at a checkpoint boundary
    CancelRequested,

    /// Execution was cancelled
    Cancelled,

    /// Execution completed successfully
    Completed,

    /// Execution failed
    Failed,
}

impl ExecutionStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "cancel_requested" => Ok(Self::CancelRequested),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Database(format!(
                "unknown execution status: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable run of a workflow
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    /// Registered workflow type name
    pub name: String,
    /// Caller-supplied unique identifier
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub wake_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: Uuid,
    pub name: String,
    pub workflow_id: String,
    pub input: serde_json::Value,
}

impl NewExecution {
    pub fn new(
        name: impl Into<String>,
        workflow_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            workflow_id: workflow_id.into(),
            input,
        }
    }
}

/// Filter for listing executions
#[derive(Debug, Clone)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub limit: u32,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
        }
    }
}

impl ExecutionFilter {
    /// Filter by status
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Limit the number of rows returned
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }
}

/// One memoized unit of work inside an execution
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub execution_id: Uuid,
    pub name: String,
    pub sequence: i32,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// A named recurring task definition
#[derive(Debug, Clone)]
pub struct CronJobRecord {
    pub name: String,
    pub schedule: String,
    pub next_run_at: DateTime<Utc>,
    pub enabled: bool,
}

/// Outcome of one cron firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl CronExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Database(format!(
                "unknown cron execution status: {}",
                s
            ))),
        }
    }
}

/// One firing of a cron job
#[derive(Debug, Clone)]
pub struct CronExecutionRecord {
    pub id: i64,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CronExecutionStatus,
    pub error: Option<String>,
}

/// Store for executions, the step ledger, signals, cron jobs and leases
///
/// This trait is the only coordination medium between replicas: there is no
/// replica-to-replica messaging and no dedicated coordinator process.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Create an execution, idempotently on `workflow_id`
    ///
    /// Returns the stored record and whether a new row was created. When an
    /// execution with the same `workflow_id` already exists, the existing
    /// record is returned unchanged.
    async fn create_execution(
        &self,
        new: NewExecution,
    ) -> Result<(ExecutionRecord, bool), StoreError>;

    /// Get an execution by its internal id
    async fn execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Get an execution by its caller-supplied workflow id
    async fn execution_by_workflow_id(
        &self,
        workflow_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// List executions, most recent first
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Transition to `running`, refresh the heartbeat and clear the wake time
    ///
    /// No-op when the execution is terminal or cancel-requested.
    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError>;

    /// Suspend a running execution; `wake_at = None` means signal-waiting
    ///
    /// No-op when cancellation was requested in the meantime.
    async fn mark_sleeping(
        &self,
        id: Uuid,
        wake_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Record a successful terminal transition with its result
    async fn complete_execution(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record a failed terminal transition with its error
    async fn fail_execution(&self, id: Uuid, error: WorkflowError) -> Result<(), StoreError>;

    /// Request cancellation and clear the wake time
    ///
    /// Returns false when the execution is already terminal.
    async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Transition a cancel-requested execution to `cancelled`
    async fn mark_cancelled(&self, id: Uuid) -> Result<(), StoreError>;

    /// Refresh the liveness heartbeat of a running execution
    async fn record_heartbeat(&self, id: Uuid) -> Result<(), StoreError>;

    /// Find executions ready to resume
    ///
    /// Covers sleepers whose wake time passed, signal-waiters with an
    /// unconsumed signal, cancel-requested rows, and running rows whose
    /// heartbeat is older than `stale_before` (abandoned by a dead replica).
    async fn due_executions(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Step Ledger Operations
    // =========================================================================

    /// Look up a committed step result
    async fn step_result(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Commit a step result, keeping the first writer on conflict
    ///
    /// The ledger is append-only: when `(execution_id, name)` already exists
    /// the stored value is returned and `result` is discarded.
    async fn record_step(
        &self,
        execution_id: Uuid,
        name: &str,
        sequence: i32,
        result: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError>;

    /// All committed steps of an execution, in sequence order
    async fn steps(&self, execution_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // Child Link Operations
    // =========================================================================

    /// Record a parent-child execution relationship (idempotent)
    async fn link_child(&self, parent: Uuid, child: Uuid) -> Result<(), StoreError>;

    /// Child execution ids of a parent
    async fn children(&self, parent: Uuid) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Signal Operations
    // =========================================================================

    /// Deliver an external signal to an execution
    async fn deliver_signal(
        &self,
        execution_id: Uuid,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Consume the oldest unconsumed signal with the given name
    async fn take_signal(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    // =========================================================================
    // Cron Operations
    // =========================================================================

    /// Create or update a cron job definition
    async fn upsert_cron_job(
        &self,
        name: &str,
        schedule: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Get a cron job definition
    async fn cron_job(&self, name: &str) -> Result<Option<CronJobRecord>, StoreError>;

    /// Enable or disable a cron job
    async fn set_cron_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError>;

    /// Enabled jobs whose next-run time has passed
    async fn due_cron_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CronJobRecord>, StoreError>;

    /// Advance a job's next-run time after a tick
    async fn advance_cron_job(
        &self,
        name: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record the start of one firing, returning its history row id
    async fn begin_cron_execution(&self, job_name: &str) -> Result<i64, StoreError>;

    /// Record the outcome of one firing
    async fn finish_cron_execution(
        &self,
        id: i64,
        status: CronExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Firing history of a job, most recent first
    async fn cron_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> Result<Vec<CronExecutionRecord>, StoreError>;

    // =========================================================================
    // Lease Operations
    // =========================================================================

    /// Atomically acquire a lease on `key`
    ///
    /// Inserts the lease row, or takes over an existing row only when its
    /// `expires_at` has already passed. Every successful acquire increments
    /// the fence token. Returns `None` when another holder owns a live lease.
    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<i64>, StoreError>;

    /// Extend a lease, only while `holder` still owns it
    ///
    /// Returns false when ownership changed after expiry - a legitimate and
    /// expected race, not an error.
    async fn renew_lease(&self, key: &str, holder: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete a lease, only while `holder` still owns it
    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), StoreError>;
}
