//! Workflow runtime: starts executions and drives replays under a lease

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::DurableError;
use crate::lease::{execution_key, Lease, LeaseManager};
use crate::persistence::{
    DurableStore, ExecutionFilter, ExecutionRecord, ExecutionStatus, NewExecution,
};
use crate::workflow::{
    ChildStarter, ExecutionHandle, StepError, Suspension, Workflow, WorkflowError,
    WorkflowRegistry,
};

/// Tuning knobs for the workflow runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// TTL on per-execution leases
    pub lease_ttl: Duration,
    /// Interval between lease renewals and liveness heartbeats
    pub heartbeat_interval: Duration,
    /// How long to park an execution whose workflow is not registered on
    /// this replica before it becomes eligible again
    pub unregistered_retry: Duration,
    /// Poll interval used by handles waiting on results
    pub handle_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            unregistered_retry: Duration::from_secs(5),
            handle_poll_interval: Duration::from_millis(25),
        }
    }
}

impl RuntimeConfig {
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_handle_poll_interval(mut self, interval: Duration) -> Self {
        self.handle_poll_interval = interval;
        self
    }
}

/// Starts workflow executions and replays them to completion
///
/// Stateless apart from its registry: every replica runs one of these over
/// the shared store, and per-execution leases keep replays single-writer.
pub struct WorkflowRuntime {
    store: Arc<dyn DurableStore>,
    leases: Arc<LeaseManager>,
    registry: Arc<WorkflowRegistry>,
    config: RuntimeConfig,
}

impl WorkflowRuntime {
    pub fn new(
        store: Arc<dyn DurableStore>,
        leases: Arc<LeaseManager>,
        registry: WorkflowRegistry,
    ) -> Self {
        Self {
            store,
            leases,
            registry: Arc::new(registry),
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Start an execution, idempotently on `workflow_id`
    ///
    /// If an execution with this workflow id already exists the stored one
    /// is joined and the input is ignored. The first replay is driven on a
    /// background task; the returned handle observes progress via the store.
    #[instrument(skip(self, input), fields(workflow = W::NAME))]
    pub async fn start<W: Workflow>(
        self: &Arc<Self>,
        workflow_id: &str,
        input: W::Input,
    ) -> Result<ExecutionHandle, DurableError> {
        if workflow_id.is_empty() {
            return Err(DurableError::Validation("workflow_id must not be empty".into()));
        }
        if !self.registry.contains(W::NAME) {
            return Err(DurableError::Validation(format!(
                "workflow '{}' is not registered",
                W::NAME
            )));
        }

        let input = serde_json::to_value(&input)?;
        let (record, created) = self
            .store
            .create_execution(NewExecution::new(W::NAME, workflow_id, input))
            .await?;

        if created {
            info!(execution_id = %record.id, workflow_id, "started execution");
            tokio::spawn(Arc::clone(self).resume(record.id));
        } else {
            debug!(execution_id = %record.id, workflow_id, "joined existing execution");
        }

        Ok(self.handle_for(record))
    }

    /// Look up an existing execution by workflow id
    pub async fn handle(&self, workflow_id: &str) -> Result<ExecutionHandle, DurableError> {
        match self.store.execution_by_workflow_id(workflow_id).await? {
            Some(record) => Ok(self.handle_for(record)),
            None => Err(DurableError::NotFound(format!(
                "no execution with workflow_id '{}'",
                workflow_id
            ))),
        }
    }

    /// Deliver a signal to an execution by workflow id
    ///
    /// Signals queue durably; delivering before the execution waits is fine.
    /// The scheduler wakes a matching waiter on its next tick.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), DurableError> {
        let execution = self
            .store
            .execution_by_workflow_id(workflow_id)
            .await?
            .ok_or_else(|| {
                DurableError::NotFound(format!("no execution with workflow_id '{}'", workflow_id))
            })?;
        Ok(self.store.deliver_signal(execution.id, name, payload).await?)
    }

    /// Request cancellation by workflow id
    ///
    /// Returns `true` if the request was recorded, `false` if the execution
    /// was already terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str) -> Result<bool, DurableError> {
        self.handle(workflow_id).await?.cancel().await
    }

    /// List executions, optionally filtered by status
    pub async fn list(&self, filter: ExecutionFilter) -> Result<Vec<ExecutionRecord>, DurableError> {
        Ok(self.store.list_executions(filter).await?)
    }

    fn handle_for(&self, record: ExecutionRecord) -> ExecutionHandle {
        ExecutionHandle::new(
            Arc::clone(&self.store),
            record.id,
            record.workflow_id,
            self.config.handle_poll_interval,
        )
    }

    /// Attempt to resume an execution on this replica
    ///
    /// No-op when another replica holds the execution's lease. Called from
    /// `start` for fresh executions and from the poll scheduler for
    /// everything it finds due.
    #[instrument(skip(self))]
    pub(crate) async fn resume(self: Arc<Self>, execution_id: Uuid) {
        let lease = match self
            .leases
            .acquire(&execution_key(execution_id), self.config.lease_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(%execution_id, "execution leased elsewhere");
                return;
            }
            Err(e) => {
                warn!(%execution_id, error = %e, "lease acquisition failed");
                return;
            }
        };

        let fenced = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(execution_id, &lease, Arc::clone(&fenced));

        if let Err(e) = self.drive(execution_id, Arc::clone(&fenced)).await {
            warn!(%execution_id, error = %e, "replay aborted on store error");
        }

        heartbeat.abort();
        if !fenced.load(Ordering::SeqCst) {
            if let Err(e) = self.leases.release(&lease).await {
                warn!(%execution_id, error = %e, "lease release failed");
            }
        }
    }

    /// One replay pass: re-verify, mark running, run the handler from the
    /// top, and persist the outcome.
    async fn drive(
        self: &Arc<Self>,
        execution_id: Uuid,
        fenced: Arc<AtomicBool>,
    ) -> Result<(), DurableError> {
        let execution = self.store.execution(execution_id).await?;

        // The due-list that led here may be stale; decide from current state.
        match execution.status {
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                return Ok(());
            }
            ExecutionStatus::CancelRequested => {
                self.store.mark_cancelled(execution_id).await?;
                info!(%execution_id, "execution cancelled while suspended");
                return Ok(());
            }
            ExecutionStatus::Sleeping => {
                if let Some(wake_at) = execution.wake_at {
                    if wake_at > Utc::now() {
                        return Ok(());
                    }
                }
            }
            ExecutionStatus::Running => {}
        }

        let Some(runner) = self.registry.runner(&execution.name) else {
            warn!(%execution_id, workflow = %execution.name, "workflow not registered on this replica");
            let retry_at = Utc::now()
                + chrono::Duration::from_std(self.config.unregistered_retry).unwrap_or_default();
            self.store.mark_running(execution_id).await?;
            self.store.mark_sleeping(execution_id, Some(retry_at)).await?;
            return Ok(());
        };

        self.store.mark_running(execution_id).await?;

        let ctx = crate::workflow::WorkflowContext::new(
            Arc::clone(&self.store),
            self.child_starter(),
            execution_id,
            execution.workflow_id.clone(),
            fenced,
        );

        debug!(%execution_id, workflow = %execution.name, "replaying");
        match runner(ctx, execution.input.clone()).await {
            Ok(output) => {
                self.store.complete_execution(execution_id, output).await?;
                info!(%execution_id, "execution completed");
            }
            Err(StepError::Suspended(Suspension::Sleep { wake_at })) => {
                self.store.mark_sleeping(execution_id, Some(wake_at)).await?;
                debug!(%execution_id, %wake_at, "execution sleeping");
            }
            Err(StepError::Suspended(Suspension::AwaitSignal { name })) => {
                self.store.mark_sleeping(execution_id, None).await?;
                debug!(%execution_id, signal = %name, "execution awaiting signal");
            }
            Err(StepError::Suspended(Suspension::Cancelled)) => {
                self.store.mark_cancelled(execution_id).await?;
                info!(%execution_id, "execution cancelled at checkpoint");
            }
            Err(StepError::Suspended(Suspension::Fenced)) => {
                // Another replica took over; it owns all further writes.
                warn!(%execution_id, "replay fenced, discarding local progress");
            }
            Err(StepError::Failed(error)) => {
                error!(%execution_id, error = %error, "execution failed");
                self.store.fail_execution(execution_id, error).await?;
            }
            Err(StepError::Serialization(e)) => {
                // Deterministic: retrying the same bytes cannot succeed.
                let error = WorkflowError::new(format!("serialization error: {}", e));
                error!(%execution_id, error = %error, "execution failed");
                self.store.fail_execution(execution_id, error).await?;
            }
            Err(StepError::Store(e)) => {
                // Transient by assumption: leave the row running so the
                // stale-heartbeat sweep reclaims it after the lease lapses.
                warn!(%execution_id, error = %e, "replay hit store error, leaving for reclaim");
            }
        }
        Ok(())
    }

    /// Renew the lease and record liveness until aborted; a failed renewal
    /// flips the fence flag so the replay stops at its next checkpoint.
    fn spawn_heartbeat(
        &self,
        execution_id: Uuid,
        lease: &Lease,
        fenced: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let leases = Arc::clone(&self.leases);
        let lease = lease.clone();
        let interval = self.config.heartbeat_interval;
        let ttl = self.config.lease_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match leases.renew(&lease, ttl).await {
                    Ok(true) => {
                        if let Err(e) = store.record_heartbeat(execution_id).await {
                            warn!(%execution_id, error = %e, "heartbeat write failed");
                        }
                    }
                    Ok(false) => {
                        warn!(%execution_id, "lost lease, fencing replay");
                        fenced.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!(%execution_id, error = %e, "lease renewal errored, fencing replay");
                        fenced.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        })
    }

    fn child_starter(self: &Arc<Self>) -> Arc<dyn ChildStarter> {
        Arc::new(RuntimeChildStarter {
            runtime: Arc::clone(self),
        })
    }
}

/// Lets a context start sub-workflows through the runtime that is driving it
struct RuntimeChildStarter {
    runtime: Arc<WorkflowRuntime>,
}

#[async_trait]
impl ChildStarter for RuntimeChildStarter {
    async fn start_child_execution(
        &self,
        parent: Uuid,
        name: &str,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StepError> {
        if !self.runtime.registry.contains(name) {
            return Err(StepError::failed(format!(
                "child workflow '{}' is not registered",
                name
            )));
        }
        let (record, created) = self
            .runtime
            .store
            .create_execution(NewExecution::new(name, workflow_id, input))
            .await?;
        self.runtime.store.link_child(parent, record.id).await?;
        if created {
            debug!(parent = %parent, child = %record.id, workflow = name, "started child execution");
            tokio::spawn(Arc::clone(&self.runtime).resume(record.id));
        }
        Ok(record.id)
    }
}
