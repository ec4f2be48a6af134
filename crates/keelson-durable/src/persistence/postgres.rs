//! PostgreSQL implementation of DurableStore
//!
//! Production persistence using PostgreSQL with:
//! - Idempotent execution creation via the workflow_id unique constraint
//! - Append-only step ledger with first-writer-wins conflict handling
//! - Fenced TTL leases via a single conditional upsert

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::WorkflowError;

/// PostgreSQL implementation of DurableStore
///
/// Uses a caller-provided connection pool; this crate never opens
/// connections of its own.
///
/// # Example
///
/// ```ignore
/// use keelson_durable::PostgresDurableStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresDurableStore::new(pool);
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");

    Ok(ExecutionRecord {
        id: row.get("id"),
        name: row.get("name"),
        workflow_id: row.get("workflow_id"),
        status: ExecutionStatus::parse(&status)?,
        input: row.get("input"),
        result: row.get("result"),
        error: error_json.and_then(|v| serde_json::from_value(v).ok()),
        wake_at: row.get("wake_at"),
        heartbeat_at: row.get("heartbeat_at"),
        created_at: row.get("created_at"),
    })
}

fn row_to_cron_job(row: &sqlx::postgres::PgRow) -> CronJobRecord {
    CronJobRecord {
        name: row.get("name"),
        schedule: row.get("schedule"),
        next_run_at: row.get("next_run_at"),
        enabled: row.get("enabled"),
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id))]
    async fn create_execution(
        &self,
        new: NewExecution,
    ) -> Result<(ExecutionRecord, bool), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflows (id, name, workflow_id, status, input, heartbeat_at)
            VALUES ($1, $2, $3, 'running', $4, NOW())
            ON CONFLICT (workflow_id) DO NOTHING
            RETURNING id, name, workflow_id, status, input, result, error,
                      wake_at, heartbeat_at, created_at
            "#,
        )
        .bind(new.id)
        .bind(&new.name)
        .bind(&new.workflow_id)
        .bind(&new.input)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create execution: {}", e);
            db_err(e)
        })?;

        if let Some(row) = inserted {
            debug!(execution_id = %new.id, "created execution");
            return Ok((row_to_execution(&row)?, true));
        }

        // Lost the insert to an earlier start() with the same workflow_id
        let existing = self
            .execution_by_workflow_id(&new.workflow_id)
            .await?
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "execution for workflow_id '{}' vanished after conflict",
                    new.workflow_id
                ))
            })?;
        Ok((existing, false))
    }

    #[instrument(skip(self))]
    async fn execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, workflow_id, status, input, result, error,
                   wake_at, heartbeat_at, created_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(id))?;

        row_to_execution(&row)
    }

    #[instrument(skip(self))]
    async fn execution_by_workflow_id(
        &self,
        workflow_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, workflow_id, status, input, result, error,
                   wake_at, heartbeat_at, created_at
            FROM workflows
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| row_to_execution(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, name, workflow_id, status, input, result, error,
                   wake_at, heartbeat_at, created_at
            FROM workflows
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'running', heartbeat_at = NOW(), wake_at = NULL
            WHERE id = $1 AND status IN ('running', 'sleeping')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_sleeping(
        &self,
        id: Uuid,
        wake_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'sleeping', wake_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(wake_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%id, ?wake_at, "execution suspended");
        Ok(())
    }

    #[instrument(skip(self, result))]
    async fn complete_execution(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'completed', result = $2, wake_at = NULL
            WHERE id = $1 AND status IN ('running', 'cancel_requested')
            "#,
        )
        .bind(id)
        .bind(&result)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%id, "execution completed");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_execution(&self, id: Uuid, error: WorkflowError) -> Result<(), StoreError> {
        let error_json =
            serde_json::to_value(&error).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'failed', error = $2, wake_at = NULL
            WHERE id = $1 AND status IN ('running', 'cancel_requested')
            "#,
        )
        .bind(id)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%id, "execution failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'cancel_requested', wake_at = NULL
            WHERE id = $1 AND status IN ('running', 'sleeping', 'cancel_requested')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn mark_cancelled(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'cancelled', wake_at = NULL
            WHERE id = $1 AND status = 'cancel_requested'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%id, "execution cancelled");
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET heartbeat_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_executions(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflows
            WHERE (status = 'sleeping' AND wake_at IS NOT NULL AND wake_at <= $1)
               OR (status = 'cancel_requested')
               OR (status = 'running' AND heartbeat_at < $2)
               OR (status = 'sleeping' AND wake_at IS NULL AND EXISTS (
                      SELECT 1 FROM workflow_signals s
                      WHERE s.execution_id = workflows.id AND s.consumed_at IS NULL))
            ORDER BY created_at
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to scan due executions: {}", e);
            db_err(e)
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn step_result(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT result FROM workflow_steps
            WHERE execution_id = $1 AND name = $2
            "#,
        )
        .bind(execution_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("result")))
    }

    #[instrument(skip(self, result))]
    async fn record_step(
        &self,
        execution_id: Uuid,
        name: &str,
        sequence: i32,
        result: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_steps (execution_id, name, sequence, result)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (execution_id, name) DO NOTHING
            RETURNING result
            "#,
        )
        .bind(execution_id)
        .bind(name)
        .bind(sequence)
        .bind(&result)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = inserted {
            debug!(%execution_id, name, sequence, "committed step");
            return Ok(row.get("result"));
        }

        // A concurrent resume raced ahead; the committed row wins and the
        // locally computed value is discarded.
        let committed = self.step_result(execution_id, name).await?.ok_or_else(|| {
            StoreError::Database(format!(
                "step '{}' of {} vanished after conflict",
                name, execution_id
            ))
        })?;
        debug!(%execution_id, name, "step lost insert race, keeping committed result");
        Ok(committed)
    }

    async fn steps(&self, execution_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, name, sequence, result, completed_at
            FROM workflow_steps
            WHERE execution_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| StepRecord {
                execution_id: row.get("execution_id"),
                name: row.get("name"),
                sequence: row.get("sequence"),
                result: row.get("result"),
                completed_at: row.get("completed_at"),
            })
            .collect())
    }

    async fn link_child(&self, parent: Uuid, child: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_children (parent_execution_id, child_execution_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(parent)
        .bind(child)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn children(&self, parent: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT child_execution_id FROM workflow_children
            WHERE parent_execution_id = $1
            "#,
        )
        .bind(parent)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| r.get("child_execution_id")).collect())
    }

    #[instrument(skip(self, payload))]
    async fn deliver_signal(
        &self,
        execution_id: Uuid,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_signals (execution_id, name, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(execution_id)
        .bind(name)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to deliver signal: {}", e);
            db_err(e)
        })?;

        debug!(%execution_id, name, "delivered signal");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn take_signal(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_signals
            SET consumed_at = NOW()
            WHERE id = (
                SELECT id FROM workflow_signals
                WHERE execution_id = $1 AND name = $2 AND consumed_at IS NULL
                ORDER BY received_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .bind(execution_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("payload")))
    }

    #[instrument(skip(self))]
    async fn upsert_cron_job(
        &self,
        name: &str,
        schedule: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (name, schedule, next_run_at, enabled)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (name) DO UPDATE SET
                schedule = EXCLUDED.schedule,
                next_run_at = CASE
                    WHEN cron_jobs.schedule = EXCLUDED.schedule THEN cron_jobs.next_run_at
                    ELSE EXCLUDED.next_run_at
                END
            "#,
        )
        .bind(name)
        .bind(schedule)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(name, schedule, "registered cron job");
        Ok(())
    }

    async fn cron_job(&self, name: &str) -> Result<Option<CronJobRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, schedule, next_run_at, enabled
            FROM cron_jobs
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| row_to_cron_job(&r)))
    }

    #[instrument(skip(self))]
    async fn set_cron_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cron_jobs SET enabled = $2 WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CronJobNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn due_cron_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CronJobRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, schedule, next_run_at, enabled
            FROM cron_jobs
            WHERE enabled AND next_run_at <= $1
            ORDER BY next_run_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(row_to_cron_job).collect())
    }

    #[instrument(skip(self))]
    async fn advance_cron_job(
        &self,
        name: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE cron_jobs SET next_run_at = $2 WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn begin_cron_execution(&self, job_name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO cron_executions (job_name, status)
            VALUES ($1, 'running')
            RETURNING id
            "#,
        )
        .bind(job_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("id"))
    }

    #[instrument(skip(self))]
    async fn finish_cron_execution(
        &self,
        id: i64,
        status: CronExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE cron_executions
            SET finished_at = NOW(), status = $2, error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn cron_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> Result<Vec<CronExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_name, started_at, finished_at, status, error
            FROM cron_executions
            WHERE job_name = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(CronExecutionRecord {
                    id: row.get("id"),
                    job_name: row.get("job_name"),
                    started_at: row.get("started_at"),
                    finished_at: row.get("finished_at"),
                    status: CronExecutionStatus::parse(&status)?,
                    error: row.get("error"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<i64>, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        // Insert, or take over only an expired row. The fence token increments
        // on every successful acquire so a stale holder can be detected.
        let row = sqlx::query(
            r#"
            INSERT INTO cron_locks (key, holder, expires_at, fence_token)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (key) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at,
                fence_token = cron_locks.fence_token + 1
            WHERE cron_locks.expires_at <= NOW()
            RETURNING fence_token
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => {
                let fence: i64 = r.get("fence_token");
                debug!(key, holder, fence, "acquired lease");
                Ok(Some(fence))
            }
            None => Ok(None),
        }
    }

    async fn renew_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE cron_locks
            SET expires_at = $3
            WHERE key = $1 AND holder = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), StoreError> {
        // Expire rather than delete so the key's fence token keeps
        // increasing across release/re-acquire cycles.
        sqlx::query(
            r#"
            UPDATE cron_locks SET expires_at = NOW() WHERE key = $1 AND holder = $2
            "#,
        )
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
