//! Cron runtime: distributed recurring tasks over the shared store
//!
//! Every replica registers the same jobs and checks for due ones on its
//! scheduler tick; a per-job lease makes sure each tick fires on exactly one
//! replica. Missed ticks are not backfilled: after a tick runs (or after an
//! outage), `next_run_at` advances past now.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::schedule::Schedule;
use crate::error::DurableError;
use crate::lease::{cron_key, LeaseManager};
use crate::persistence::{CronExecutionRecord, CronExecutionStatus, CronJobRecord, DurableStore};
use crate::workflow::WorkflowError;

type CronHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<(), WorkflowError>> + Send + Sync>;

struct CronJobEntry {
    schedule: Schedule,
    handler: CronHandler,
}

/// Tuning knobs for the cron runtime
#[derive(Debug, Clone)]
pub struct CronConfig {
    /// TTL on per-job tick leases; longer than any handler is expected to run
    pub lease_ttl: Duration,
    /// Maximum due jobs claimed per scheduler tick
    pub batch_size: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            batch_size: 20,
        }
    }
}

impl CronConfig {
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

/// Registers cron jobs and fires the due ones
pub struct CronRuntime {
    store: Arc<dyn DurableStore>,
    leases: Arc<LeaseManager>,
    jobs: RwLock<HashMap<String, CronJobEntry>>,
    config: CronConfig,
}

impl CronRuntime {
    pub fn new(store: Arc<dyn DurableStore>, leases: Arc<LeaseManager>) -> Self {
        Self {
            store,
            leases,
            jobs: RwLock::new(HashMap::new()),
            config: CronConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CronConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a job, creating or updating its stored definition
    ///
    /// Registration is idempotent. When the schedule expression changed,
    /// `next_run_at` is recomputed from now; otherwise the stored one is
    /// kept so a rolling restart does not shift the cadence.
    #[instrument(skip(self, handler))]
    pub async fn register<F, Fut>(
        self: &Arc<Self>,
        name: &str,
        expression: &str,
        handler: F,
    ) -> Result<CronHandle, DurableError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), WorkflowError>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(DurableError::Validation("cron job name must not be empty".into()));
        }
        let schedule = Schedule::parse(expression)?;
        let next_run_at = schedule.next_after(Utc::now()).ok_or_else(|| {
            DurableError::Validation(format!("schedule '{}' never fires", expression))
        })?;

        self.store
            .upsert_cron_job(name, expression, next_run_at)
            .await?;

        let handler: CronHandler = Arc::new(move || Box::pin(handler()));
        self.jobs.write().insert(
            name.to_string(),
            CronJobEntry { schedule, handler },
        );
        info!(job = name, schedule = expression, "registered cron job");

        Ok(CronHandle {
            runtime: Arc::clone(self),
            name: name.to_string(),
        })
    }

    /// Fire every due job this replica wins the lease for
    ///
    /// Called from the poll scheduler on each tick. Jobs registered on other
    /// replicas but not on this one are skipped here and picked up by a
    /// replica that knows them.
    pub async fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<(), DurableError> {
        let due = self.store.due_cron_jobs(now, self.config.batch_size).await?;
        for job in due {
            if self.jobs.read().contains_key(&job.name) {
                let runtime = Arc::clone(self);
                tokio::spawn(async move {
                    runtime.run_tick(job).await;
                });
            }
        }
        Ok(())
    }

    /// Run one tick under the job's lease
    ///
    /// The due-list that led here is a snapshot; after winning the lease the
    /// job row is re-read and re-checked, so a tick another replica already
    /// ran (and advanced past) is not run twice.
    #[instrument(skip(self, job), fields(job = %job.name))]
    async fn run_tick(self: Arc<Self>, job: CronJobRecord) {
        let lease = match self
            .leases
            .acquire(&cron_key(&job.name), self.config.lease_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(job = %job.name, "tick leased elsewhere");
                return;
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "cron lease acquisition failed");
                return;
            }
        };

        let outcome = self.leased_tick(&job.name).await;
        if let Err(e) = self.leases.release(&lease).await {
            warn!(job = %job.name, error = %e, "lease release failed");
        }

        if let Err(e) = outcome {
            warn!(job = %job.name, error = %e, "cron tick failed against store");
        }
    }

    async fn leased_tick(&self, name: &str) -> Result<(), DurableError> {
        let Some(current) = self.store.cron_job(name).await? else {
            return Ok(());
        };
        if !current.enabled || current.next_run_at > Utc::now() {
            return Ok(());
        }

        let entry_handler = {
            let jobs = self.jobs.read();
            match jobs.get(name) {
                Some(entry) => Arc::clone(&entry.handler),
                None => return Ok(()),
            }
        };

        self.fire(name, entry_handler).await?;

        // Advance strictly past now so a slow handler never causes the same
        // tick to fire again, and missed ticks collapse into the next one.
        let schedule = {
            let jobs = self.jobs.read();
            jobs.get(name).map(|entry| entry.schedule.clone())
        };
        if let Some(schedule) = schedule {
            if let Some(next) = schedule.next_after(Utc::now()) {
                self.store.advance_cron_job(name, next).await?;
            }
        }
        Ok(())
    }

    /// Run the handler and record the firing in history
    async fn fire(&self, name: &str, handler: CronHandler) -> Result<(), DurableError> {
        let history_id = self.store.begin_cron_execution(name).await?;
        debug!(job = name, history_id, "firing cron job");
        match handler().await {
            Ok(()) => {
                self.store
                    .finish_cron_execution(history_id, CronExecutionStatus::Succeeded, None)
                    .await?;
            }
            Err(e) => {
                error!(job = name, error = %e, "cron handler failed");
                self.store
                    .finish_cron_execution(
                        history_id,
                        CronExecutionStatus::Failed,
                        Some(&e.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// Handle to a registered cron job
pub struct CronHandle {
    runtime: Arc<CronRuntime>,
    name: String,
}

impl CronHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the job once, immediately, on this replica
    ///
    /// Bypasses the schedule and the tick lease; records exactly one history
    /// row. The stored `next_run_at` is untouched.
    pub async fn trigger(&self) -> Result<(), DurableError> {
        let handler = {
            let jobs = self.runtime.jobs.read();
            jobs.get(&self.name).map(|entry| Arc::clone(&entry.handler))
        };
        let Some(handler) = handler else {
            return Err(DurableError::NotFound(format!(
                "cron job '{}' is not registered",
                self.name
            )));
        };
        self.runtime.fire(&self.name, handler).await
    }

    /// Pause the schedule; a disabled job never becomes due
    pub async fn disable(&self) -> Result<(), DurableError> {
        Ok(self.runtime.store.set_cron_enabled(&self.name, false).await?)
    }

    /// Resume the schedule
    pub async fn enable(&self) -> Result<(), DurableError> {
        Ok(self.runtime.store.set_cron_enabled(&self.name, true).await?)
    }

    /// Recent firing history, most recent first
    pub async fn history(&self, limit: usize) -> Result<Vec<CronExecutionRecord>, DurableError> {
        Ok(self.runtime.store.cron_history(&self.name, limit).await?)
    }
}
