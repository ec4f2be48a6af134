//! Workflow context: the step ledger's replay surface
//!
//! The context intercepts `step`, `sleep` and `wait_for_signal` calls and
//! turns them into durable checkpoints. Suspension is expressed as an error
//! variant that handlers propagate with `?` and the runtime catches - the
//! explicit rendition of replay-based suspension in a language without
//! transparent continuation capture.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::definition::{Workflow, WorkflowError};
use crate::persistence::{DurableStore, ExecutionStatus, StoreError};

/// Why a replay stopped before reaching the handler's end
#[derive(Debug, Clone)]
pub enum Suspension {
    /// Sleeping until `wake_at`
    Sleep { wake_at: DateTime<Utc> },

    /// Waiting for a named signal
    AwaitSignal { name: String },

    /// Cancellation was observed at a checkpoint boundary
    Cancelled,

    /// The replica's lease was lost mid-replay; another replica owns the
    /// execution now and this replay's remaining work must be discarded
    Fenced,
}

/// Error type flowing out of checkpoint calls and handler bodies
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Not a failure: the execution suspended at a checkpoint
    #[error("execution suspended")]
    Suspended(Suspension),

    /// Handler code failed inside a step
    #[error("{0}")]
    Failed(WorkflowError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StepError {
    /// Convenience constructor for handler failures
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(WorkflowError::new(message))
    }
}

impl From<WorkflowError> for StepError {
    fn from(error: WorkflowError) -> Self {
        Self::Failed(error)
    }
}

/// Starts child executions on behalf of a context
///
/// Implemented by the workflow runtime; a trait seam here keeps the context
/// free of a direct runtime dependency.
#[async_trait]
pub trait ChildStarter: Send + Sync {
    /// Idempotently create and drive a child execution, returning its id
    async fn start_child_execution(
        &self,
        parent: Uuid,
        name: &str,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StepError>;
}

/// Durable form of a sleep checkpoint: the wake deadline is committed to the
/// ledger on first encounter so replays agree on it.
#[derive(Serialize, Deserialize)]
struct SleepCheckpoint {
    wake_at: DateTime<Utc>,
}

/// Context object handed to workflow handlers
///
/// Suspension points for the handler's logical thread are exactly `step`,
/// `sleep` and `wait_for_signal`. Code between checkpoints runs to
/// completion without interruption and may run more than once under replay -
/// any effect outside a `step` wrapper is unsafe.
pub struct WorkflowContext {
    store: Arc<dyn DurableStore>,
    starter: Arc<dyn ChildStarter>,
    execution_id: Uuid,
    workflow_id: String,
    sequence: AtomicI32,
    fenced: Arc<AtomicBool>,
}

impl WorkflowContext {
    pub(crate) fn new(
        store: Arc<dyn DurableStore>,
        starter: Arc<dyn ChildStarter>,
        execution_id: Uuid,
        workflow_id: String,
        fenced: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            starter,
            execution_id,
            workflow_id,
            sequence: AtomicI32::new(0),
            fenced,
        }
    }

    /// Internal id of this execution
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Caller-supplied workflow id of this execution
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Execute a memoized step
    ///
    /// On replay of an already-committed step the stored result is returned
    /// and `fn` is never invoked - this is what makes a crashed-and-resumed
    /// execution observably identical to one that ran straight through.
    /// If a concurrent resume commits the same step first, the committed
    /// value wins and the locally computed one is discarded.
    ///
    /// Step names must be unique within one execution; reuse is a caller
    /// error and is not guarded against at this layer.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>> + Send,
    {
        let sequence = self.next_sequence();

        if let Some(committed) = self.store.step_result(self.execution_id, name).await? {
            return Ok(serde_json::from_value(committed)?);
        }

        self.checkpoint_guard().await?;

        debug!(execution_id = %self.execution_id, step = name, "running step");
        let value = f().await.map_err(StepError::Failed)?;
        let json = serde_json::to_value(&value)?;

        if self.fenced.load(Ordering::SeqCst) {
            return Err(StepError::Suspended(Suspension::Fenced));
        }

        let committed = self
            .store
            .record_step(self.execution_id, name, sequence, json)
            .await?;
        Ok(serde_json::from_value(committed)?)
    }

    /// Suspend for at least `duration` without holding a thread
    ///
    /// The wake deadline is committed to the ledger on first encounter;
    /// replays before the deadline re-suspend, replays after it run through
    /// instantly. Resumption is driven by the poll scheduler.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        let sequence = self.next_sequence();
        let name = format!("__sleep:{}", sequence);

        let wake_at = match self.store.step_result(self.execution_id, &name).await? {
            Some(committed) => serde_json::from_value::<SleepCheckpoint>(committed)?.wake_at,
            None => {
                self.checkpoint_guard().await?;
                let wake_at =
                    Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
                let committed = self
                    .store
                    .record_step(
                        self.execution_id,
                        &name,
                        sequence,
                        serde_json::to_value(SleepCheckpoint { wake_at })?,
                    )
                    .await?;
                // A racing resume may have committed a slightly different
                // deadline; the ledger's value is authoritative.
                serde_json::from_value::<SleepCheckpoint>(committed)?.wake_at
            }
        };

        if Utc::now() >= wake_at {
            return Ok(());
        }
        self.checkpoint_guard().await?;
        Err(StepError::Suspended(Suspension::Sleep { wake_at }))
    }

    /// Suspend until a matching signal is delivered, returning its payload
    ///
    /// The payload is committed to the ledger at consumption, so replays
    /// observe the same value without touching the signal row again.
    pub async fn wait_for_signal(&self, name: &str) -> Result<serde_json::Value, StepError> {
        let sequence = self.next_sequence();
        let checkpoint = format!("__signal:{}:{}", sequence, name);

        if let Some(committed) = self
            .store
            .step_result(self.execution_id, &checkpoint)
            .await?
        {
            return Ok(committed);
        }

        self.checkpoint_guard().await?;

        match self.store.take_signal(self.execution_id, name).await? {
            Some(payload) => {
                let committed = self
                    .store
                    .record_step(self.execution_id, &checkpoint, sequence, payload)
                    .await?;
                Ok(committed)
            }
            None => Err(StepError::Suspended(Suspension::AwaitSignal {
                name: name.to_string(),
            })),
        }
    }

    /// Start a sub-workflow, idempotently on its workflow id
    ///
    /// Records the parent-child link and returns the child's execution id.
    /// Safe under replay: a repeated call with the same workflow id joins the
    /// existing child instead of starting a second one.
    pub async fn start_child<W: Workflow>(
        &self,
        workflow_id: &str,
        input: W::Input,
    ) -> Result<Uuid, StepError> {
        self.checkpoint_guard().await?;
        let input = serde_json::to_value(&input)?;
        self.starter
            .start_child_execution(self.execution_id, W::NAME, workflow_id, input)
            .await
    }

    fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Cancellation and fencing are observed only here, at checkpoint
    /// boundaries - an in-flight step cannot be preempted.
    async fn checkpoint_guard(&self) -> Result<(), StepError> {
        if self.fenced.load(Ordering::SeqCst) {
            return Err(StepError::Suspended(Suspension::Fenced));
        }
        let execution = self.store.execution(self.execution_id).await?;
        if execution.status == ExecutionStatus::CancelRequested {
            return Err(StepError::Suspended(Suspension::Cancelled));
        }
        Ok(())
    }
}
