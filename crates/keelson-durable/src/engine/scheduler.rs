//! Poll scheduler: per-replica discovery of executions due for resumption
//!
//! Every replica runs one scheduler over the shared store. There is no
//! coordinator: each tick scans for due work and races the other replicas
//! for per-execution leases, so a replica crash delays resumption by at
//! most one lease TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runtime::WorkflowRuntime;
use crate::cron::CronRuntime;
use crate::error::DurableError;

/// Tuning knobs for the poll scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base interval between scans; each sleep is jittered +-20% so
    /// replicas started together drift apart
    pub poll_interval: Duration,
    /// Maximum executions claimed per tick
    pub batch_size: usize,
    /// Running executions with no heartbeat for this long are presumed
    /// orphaned by a crashed replica and become due again
    pub stale_after: Duration,
    /// Ceiling for the multiplicative backoff applied on store errors
    pub max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            stale_after: Duration::from_secs(60),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Background loop waking due sleepers, signal waiters, cancellation
/// requests, stale orphans, and due cron jobs
pub struct PollScheduler {
    runtime: Arc<WorkflowRuntime>,
    cron: Option<Arc<CronRuntime>>,
    config: SchedulerConfig,
}

impl PollScheduler {
    pub fn new(runtime: Arc<WorkflowRuntime>) -> Self {
        Self {
            runtime,
            cron: None,
            config: SchedulerConfig::default(),
        }
    }

    /// Attach a cron runtime whose due jobs are checked on every tick
    pub fn with_cron(mut self, cron: Arc<CronRuntime>) -> Self {
        self.cron = Some(cron);
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the scheduler loop
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval = ?self.config.poll_interval, "poll scheduler started");
        let mut delay = self.config.poll_interval;
        loop {
            match self.tick().await {
                Ok(()) => delay = self.config.poll_interval,
                Err(e) => {
                    delay = (delay * 2).min(self.config.max_backoff);
                    warn!(error = %e, backoff = ?delay, "scheduler tick failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(jittered(delay)) => {}
                _ = shutdown.changed() => {
                    info!("poll scheduler stopping");
                    return;
                }
            }
        }
    }

    /// One scan: claim due executions, then run due cron jobs
    async fn tick(&self) -> Result<(), DurableError> {
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.config.stale_after).unwrap_or_default();

        let due = self
            .runtime
            .store()
            .due_executions(now, stale_before, self.config.batch_size)
            .await?;
        if !due.is_empty() {
            debug!(count = due.len(), "found due executions");
        }
        for execution_id in due {
            tokio::spawn(Arc::clone(&self.runtime).resume(execution_id));
        }

        if let Some(cron) = &self.cron {
            cron.run_due(now).await?;
        }
        Ok(())
    }
}

/// Stops the scheduler loop when asked, or when dropped
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}
