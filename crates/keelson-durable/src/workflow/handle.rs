//! Client-side handle to a running execution

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::DurableError;
use crate::persistence::{DurableStore, ExecutionStatus};

/// Handle returned by `WorkflowRuntime::start`
///
/// A thin view over the execution row: all state lives in the store, so a
/// handle can be dropped and reconstructed freely from the execution id.
pub struct ExecutionHandle {
    store: Arc<dyn DurableStore>,
    execution_id: Uuid,
    workflow_id: String,
    poll_interval: Duration,
}

impl ExecutionHandle {
    pub(crate) fn new(
        store: Arc<dyn DurableStore>,
        execution_id: Uuid,
        workflow_id: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            execution_id,
            workflow_id,
            poll_interval,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Current status of the execution
    pub async fn status(&self) -> Result<ExecutionStatus, DurableError> {
        Ok(self.store.execution(self.execution_id).await?.status)
    }

    /// Block until the execution reaches a terminal state, up to `timeout`
    ///
    /// Returns the committed result for a completed execution; a failed or
    /// cancelled execution surfaces as the corresponding error.
    pub async fn result(&self, timeout: Duration) -> Result<Value, DurableError> {
        let deadline = Instant::now() + timeout;
        loop {
            let execution = self.store.execution(self.execution_id).await?;
            match execution.status {
                ExecutionStatus::Completed => {
                    return Ok(execution.result.unwrap_or(Value::Null));
                }
                ExecutionStatus::Failed => {
                    let error = execution
                        .error
                        .unwrap_or_else(|| crate::workflow::WorkflowError::new("workflow failed"));
                    return Err(DurableError::ExecutionFailed(error));
                }
                ExecutionStatus::Cancelled => return Err(DurableError::ExecutionCancelled),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(DurableError::Timeout { waited: timeout });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Typed variant of [`result`](Self::result)
    pub async fn result_as<T: DeserializeOwned>(&self, timeout: Duration) -> Result<T, DurableError> {
        let value = self.result(timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Request cooperative cancellation
    ///
    /// Returns `true` if the request was recorded, `false` if the execution
    /// was already terminal. The execution stops at its next checkpoint, or
    /// immediately if it is currently suspended.
    pub async fn cancel(&self) -> Result<bool, DurableError> {
        Ok(self.store.request_cancel(self.execution_id).await?)
    }
}
