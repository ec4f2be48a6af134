//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::context::{StepError, WorkflowContext};

/// Error type recorded when an execution fails
///
/// Step failures are not retried by the engine; callers that want retries
/// implement them inside the step function.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a replayable handler function
///
/// The handler is re-invoked from its beginning every time its execution is
/// started or resumed. Checkpoints (`step`, `sleep`, `wait_for_signal` on the
/// context) consult durable storage first: already-completed checkpoints
/// resolve instantly, so the handler races forward in memory until it reaches
/// the first checkpoint that is not yet satisfied.
///
/// # Determinism
///
/// Handlers must be deterministic between checkpoints: no clocks, random
/// numbers, or external calls outside a `step` wrapper. Anything outside a
/// step may run more than once under replay.
///
/// # Example
///
/// ```ignore
/// use keelson_durable::prelude::*;
///
/// struct Onboarding;
///
/// #[async_trait]
/// impl Workflow for Onboarding {
///     const NAME: &'static str = "onboarding";
///     type Input = SignupRequest;
///     type Output = SignupReceipt;
///
///     async fn run(
///         &self,
///         ctx: &WorkflowContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, StepError> {
///         let account = ctx.step("create-account", || create_account(&input)).await?;
///         ctx.sleep(Duration::from_secs(24 * 3600)).await?;
///         let receipt = ctx.step("send-welcome", || send_welcome(&account)).await?;
///         Ok(receipt)
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique name for this workflow type
    ///
    /// Used to look up the handler in the registry when resuming.
    const NAME: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when the workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// The handler body, replayed from the top on every (re)start
    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, StepError>;
}
