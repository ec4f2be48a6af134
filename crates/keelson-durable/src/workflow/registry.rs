//! Workflow registry: name -> type-erased runner

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::context::{StepError, WorkflowContext};
use super::definition::Workflow;

type WorkflowRunner =
    Arc<dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// Maps workflow names to runnable handlers
///
/// Input and output types are erased to JSON at the boundary so the runtime
/// can drive any registered workflow from a stored execution row.
#[derive(Default)]
pub struct WorkflowRegistry {
    runners: HashMap<String, WorkflowRunner>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its `NAME`
    ///
    /// Later registrations under the same name replace earlier ones.
    pub fn register<W: Workflow>(&mut self, workflow: W) {
        let workflow = Arc::new(workflow);
        let runner: WorkflowRunner = Arc::new(move |ctx, input| {
            let workflow = Arc::clone(&workflow);
            Box::pin(async move {
                let input: W::Input = serde_json::from_value(input)?;
                let output = workflow.run(&ctx, input).await?;
                Ok(serde_json::to_value(&output)?)
            })
        });
        debug!(workflow = W::NAME, "registered workflow");
        self.runners.insert(W::NAME.to_string(), runner);
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with<W: Workflow>(mut self, workflow: W) -> Self {
        self.register(workflow);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    pub(crate) fn runner(&self, name: &str) -> Option<WorkflowRunner> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Workflow for Noop {
        const NAME: &'static str = "noop";
        type Input = ();
        type Output = ();

        async fn run(&self, _ctx: &WorkflowContext, _input: ()) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = WorkflowRegistry::new().with(Noop);
        assert!(registry.contains("noop"));
        assert!(!registry.contains("other"));
        assert!(registry.runner("noop").is_some());
    }
}
