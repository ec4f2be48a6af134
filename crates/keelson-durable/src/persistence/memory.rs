//! In-memory implementation of DurableStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::WorkflowError;

struct SignalState {
    name: String,
    payload: serde_json::Value,
    received_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

struct LeaseState {
    holder: String,
    expires_at: DateTime<Utc>,
    fence_token: i64,
}

/// In-memory implementation of DurableStore
///
/// Primarily for testing. Provides the same semantics as the PostgreSQL
/// implementation, including conditional status transitions and lease
/// fencing, so the full engine can be exercised without a database.
///
/// # Example
///
/// ```
/// use keelson_durable::InMemoryDurableStore;
///
/// let store = InMemoryDurableStore::new();
/// ```
pub struct InMemoryDurableStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    steps: RwLock<HashMap<Uuid, Vec<StepRecord>>>,
    children: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    signals: RwLock<HashMap<Uuid, Vec<SignalState>>>,
    cron_jobs: RwLock<HashMap<String, CronJobRecord>>,
    cron_executions: RwLock<Vec<CronExecutionRecord>>,
    leases: RwLock<HashMap<String, LeaseState>>,
    cron_execution_seq: AtomicI64,
}

impl InMemoryDurableStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
            signals: RwLock::new(HashMap::new()),
            cron_jobs: RwLock::new(HashMap::new()),
            cron_executions: RwLock::new(Vec::new()),
            leases: RwLock::new(HashMap::new()),
            cron_execution_seq: AtomicI64::new(1),
        }
    }

    /// Number of executions (for tests)
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Number of committed steps across all executions (for tests)
    pub fn step_count(&self) -> usize {
        self.steps.read().values().map(Vec::len).sum()
    }

    /// Clear all data (for tests)
    pub fn clear(&self) {
        self.executions.write().clear();
        self.steps.write().clear();
        self.children.write().clear();
        self.signals.write().clear();
        self.cron_jobs.write().clear();
        self.cron_executions.write().clear();
        self.leases.write().clear();
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn create_execution(
        &self,
        new: NewExecution,
    ) -> Result<(ExecutionRecord, bool), StoreError> {
        let mut executions = self.executions.write();

        if let Some(existing) = executions
            .values()
            .find(|e| e.workflow_id == new.workflow_id)
        {
            return Ok((existing.clone(), false));
        }

        let record = ExecutionRecord {
            id: new.id,
            name: new.name,
            workflow_id: new.workflow_id,
            status: ExecutionStatus::Running,
            input: new.input,
            result: None,
            error: None,
            wake_at: None,
            heartbeat_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        executions.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn execution_by_workflow_id(
        &self,
        workflow_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .find(|e| e.workflow_id == workflow_id)
            .cloned())
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut rows: Vec<ExecutionRecord> = self
            .executions
            .read()
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(filter.limit as usize);
        Ok(rows)
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if matches!(
                e.status,
                ExecutionStatus::Running | ExecutionStatus::Sleeping
            ) {
                e.status = ExecutionStatus::Running;
                e.heartbeat_at = Some(Utc::now());
                e.wake_at = None;
            }
        }
        Ok(())
    }

    async fn mark_sleeping(
        &self,
        id: Uuid,
        wake_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if e.status == ExecutionStatus::Running {
                e.status = ExecutionStatus::Sleeping;
                e.wake_at = wake_at;
            }
        }
        Ok(())
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if matches!(
                e.status,
                ExecutionStatus::Running | ExecutionStatus::CancelRequested
            ) {
                e.status = ExecutionStatus::Completed;
                e.result = Some(result);
                e.wake_at = None;
            }
        }
        Ok(())
    }

    async fn fail_execution(&self, id: Uuid, error: WorkflowError) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if matches!(
                e.status,
                ExecutionStatus::Running | ExecutionStatus::CancelRequested
            ) {
                e.status = ExecutionStatus::Failed;
                e.error = Some(error);
                e.wake_at = None;
            }
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if !e.status.is_terminal() {
                e.status = ExecutionStatus::CancelRequested;
                e.wake_at = None;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if e.status == ExecutionStatus::CancelRequested {
                e.status = ExecutionStatus::Cancelled;
                e.wake_at = None;
            }
        }
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(e) = executions.get_mut(&id) {
            if e.status == ExecutionStatus::Running {
                e.heartbeat_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn due_executions(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let signals = self.signals.read();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .executions
            .read()
            .values()
            .filter(|e| match e.status {
                ExecutionStatus::Sleeping => match e.wake_at {
                    Some(wake) => wake <= now,
                    None => signals
                        .get(&e.id)
                        .is_some_and(|sigs| sigs.iter().any(|s| s.consumed_at.is_none())),
                },
                ExecutionStatus::CancelRequested => true,
                ExecutionStatus::Running => e.heartbeat_at.is_some_and(|hb| hb < stale_before),
                _ => false,
            })
            .map(|e| (e.created_at, e.id))
            .collect();
        // Oldest first, bounded
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn step_result(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .steps
            .read()
            .get(&execution_id)
            .and_then(|steps| steps.iter().find(|s| s.name == name))
            .map(|s| s.result.clone()))
    }

    async fn record_step(
        &self,
        execution_id: Uuid,
        name: &str,
        sequence: i32,
        result: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let mut steps = self.steps.write();
        let entry = steps.entry(execution_id).or_default();

        // Append-only: the first writer wins, later values are discarded
        if let Some(existing) = entry.iter().find(|s| s.name == name) {
            return Ok(existing.result.clone());
        }

        entry.push(StepRecord {
            execution_id,
            name: name.to_string(),
            sequence,
            result: result.clone(),
            completed_at: Utc::now(),
        });
        Ok(result)
    }

    async fn steps(&self, execution_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let mut steps = self
            .steps
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.sequence);
        Ok(steps)
    }

    async fn link_child(&self, parent: Uuid, child: Uuid) -> Result<(), StoreError> {
        let mut children = self.children.write();
        let entry = children.entry(parent).or_default();
        if !entry.contains(&child) {
            entry.push(child);
        }
        Ok(())
    }

    async fn children(&self, parent: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.children.read().get(&parent).cloned().unwrap_or_default())
    }

    async fn deliver_signal(
        &self,
        execution_id: Uuid,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.signals
            .write()
            .entry(execution_id)
            .or_default()
            .push(SignalState {
                name: name.to_string(),
                payload,
                received_at: Utc::now(),
                consumed_at: None,
            });
        Ok(())
    }

    async fn take_signal(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let mut signals = self.signals.write();
        let Some(list) = signals.get_mut(&execution_id) else {
            return Ok(None);
        };

        let oldest = list
            .iter_mut()
            .filter(|s| s.name == name && s.consumed_at.is_none())
            .min_by_key(|s| s.received_at);

        Ok(oldest.map(|s| {
            s.consumed_at = Some(Utc::now());
            s.payload.clone()
        }))
    }

    async fn upsert_cron_job(
        &self,
        name: &str,
        schedule: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.cron_jobs.write();
        match jobs.get_mut(name) {
            // Re-registration with an unchanged schedule keeps its next-run
            // time so replica restarts do not reset the cadence.
            Some(job) if job.schedule == schedule => {}
            Some(job) => {
                job.schedule = schedule.to_string();
                job.next_run_at = next_run_at;
            }
            None => {
                jobs.insert(
                    name.to_string(),
                    CronJobRecord {
                        name: name.to_string(),
                        schedule: schedule.to_string(),
                        next_run_at,
                        enabled: true,
                    },
                );
            }
        }
        Ok(())
    }

    async fn cron_job(&self, name: &str) -> Result<Option<CronJobRecord>, StoreError> {
        Ok(self.cron_jobs.read().get(name).cloned())
    }

    async fn set_cron_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let mut jobs = self.cron_jobs.write();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| StoreError::CronJobNotFound(name.to_string()))?;
        job.enabled = enabled;
        Ok(())
    }

    async fn due_cron_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CronJobRecord>, StoreError> {
        let mut due: Vec<CronJobRecord> = self
            .cron_jobs
            .read()
            .values()
            .filter(|j| j.enabled && j.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn advance_cron_job(
        &self,
        name: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(job) = self.cron_jobs.write().get_mut(name) {
            job.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn begin_cron_execution(&self, job_name: &str) -> Result<i64, StoreError> {
        let id = self.cron_execution_seq.fetch_add(1, Ordering::SeqCst);
        self.cron_executions.write().push(CronExecutionRecord {
            id,
            job_name: job_name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: CronExecutionStatus::Running,
            error: None,
        });
        Ok(id)
    }

    async fn finish_cron_execution(
        &self,
        id: i64,
        status: CronExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut executions = self.cron_executions.write();
        if let Some(e) = executions.iter_mut().find(|e| e.id == id) {
            e.finished_at = Some(Utc::now());
            e.status = status;
            e.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn cron_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> Result<Vec<CronExecutionRecord>, StoreError> {
        let mut history: Vec<CronExecutionRecord> = self
            .cron_executions
            .read()
            .iter()
            .filter(|e| e.job_name == job_name)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<i64>, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut leases = self.leases.write();

        match leases.get_mut(key) {
            Some(lease) if lease.expires_at > now => Ok(None),
            Some(lease) => {
                lease.holder = holder.to_string();
                lease.expires_at = expires_at;
                lease.fence_token += 1;
                Ok(Some(lease.fence_token))
            }
            None => {
                leases.insert(
                    key.to_string(),
                    LeaseState {
                        holder: holder.to_string(),
                        expires_at,
                        fence_token: 1,
                    },
                );
                Ok(Some(1))
            }
        }
    }

    async fn renew_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut leases = self.leases.write();
        match leases.get_mut(key) {
            Some(lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), StoreError> {
        // Expire rather than delete so the key's fence token keeps
        // increasing across release/re-acquire cycles.
        let now = Utc::now();
        let mut leases = self.leases.write();
        if let Some(lease) = leases.get_mut(key) {
            if lease.holder == holder {
                lease.expires_at = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_execution(workflow_id: &str) -> NewExecution {
        NewExecution {
            id: Uuid::now_v7(),
            name: "test_workflow".to_string(),
            workflow_id: workflow_id.to_string(),
            input: json!({}),
        }
    }

    #[tokio::test]
    async fn create_execution_is_idempotent_on_workflow_id() {
        let store = InMemoryDurableStore::new();

        let (first, created) = store.create_execution(new_execution("wf-1")).await.unwrap();
        assert!(created);

        let (second, created) = store.create_execution(new_execution("wf-1")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.execution_count(), 1);
    }

    #[tokio::test]
    async fn record_step_keeps_first_writer() {
        let store = InMemoryDurableStore::new();
        let id = Uuid::now_v7();

        let committed = store
            .record_step(id, "double", 0, json!({"value": 10}))
            .await
            .unwrap();
        assert_eq!(committed, json!({"value": 10}));

        // A racing resume computes a different value; the ledger wins
        let committed = store
            .record_step(id, "double", 0, json!({"value": 99}))
            .await
            .unwrap();
        assert_eq!(committed, json!({"value": 10}));
        assert_eq!(store.step_count(), 1);
    }

    #[tokio::test]
    async fn mark_sleeping_does_not_clobber_cancel_request() {
        let store = InMemoryDurableStore::new();
        let (exec, _) = store.create_execution(new_execution("wf-1")).await.unwrap();

        assert!(store.request_cancel(exec.id).await.unwrap());
        store
            .mark_sleeping(exec.id, Some(Utc::now()))
            .await
            .unwrap();

        let exec = store.execution(exec.id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::CancelRequested);
    }

    #[tokio::test]
    async fn take_signal_consumes_oldest_match_once() {
        let store = InMemoryDurableStore::new();
        let id = Uuid::now_v7();

        store
            .deliver_signal(id, "approval", json!({"n": 1}))
            .await
            .unwrap();
        store
            .deliver_signal(id, "approval", json!({"n": 2}))
            .await
            .unwrap();

        assert_eq!(
            store.take_signal(id, "approval").await.unwrap(),
            Some(json!({"n": 1}))
        );
        assert_eq!(
            store.take_signal(id, "approval").await.unwrap(),
            Some(json!({"n": 2}))
        );
        assert_eq!(store.take_signal(id, "approval").await.unwrap(), None);
        assert_eq!(store.take_signal(id, "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lease_fence_token_is_monotonic_across_takeovers() {
        let store = InMemoryDurableStore::new();

        let fence = store
            .acquire_lease("job:tick", "replica-a", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(fence, Some(1));

        // Live lease denies a second holder
        assert_eq!(
            store
                .acquire_lease("job:tick", "replica-b", Duration::from_secs(5))
                .await
                .unwrap(),
            None
        );

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Expired lease can be taken over, incrementing the fence
        let fence = store
            .acquire_lease("job:tick", "replica-b", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fence, Some(2));

        // The stale holder's renew fails silently
        assert!(!store
            .renew_lease("job:tick", "replica-a", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn due_executions_covers_all_wake_reasons() {
        let store = InMemoryDurableStore::new();
        let now = Utc::now();

        let (sleeper, _) = store
            .create_execution(new_execution("wf-sleeper"))
            .await
            .unwrap();
        store
            .mark_sleeping(sleeper.id, Some(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let (waiter, _) = store
            .create_execution(new_execution("wf-waiter"))
            .await
            .unwrap();
        store.mark_sleeping(waiter.id, None).await.unwrap();
        store
            .deliver_signal(waiter.id, "go", json!({}))
            .await
            .unwrap();

        let (cancelled, _) = store
            .create_execution(new_execution("wf-cancelled"))
            .await
            .unwrap();
        store.request_cancel(cancelled.id).await.unwrap();

        // Fresh heartbeat, should not appear
        let (active, _) = store
            .create_execution(new_execution("wf-active"))
            .await
            .unwrap();

        let due = store
            .due_executions(now, now - chrono::Duration::seconds(60), 10)
            .await
            .unwrap();

        assert!(due.contains(&sleeper.id));
        assert!(due.contains(&waiter.id));
        assert!(due.contains(&cancelled.id));
        assert!(!due.contains(&active.id));
    }
}
