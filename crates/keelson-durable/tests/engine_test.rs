//! End-to-end engine tests over the in-memory store
//!
//! Covers replay memoization, idempotent starts, durable timers, signals,
//! cancellation, crash recovery, and cron single-firing across replicas.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use keelson_durable::persistence::{CronExecutionStatus, NewExecution};
use keelson_durable::prelude::*;

// =============================================================================
// Harness
// =============================================================================

async fn engine(
    registry: WorkflowRegistry,
) -> (Arc<InMemoryDurableStore>, Arc<WorkflowRuntime>, SchedulerHandle) {
    let store = Arc::new(InMemoryDurableStore::new());
    let leases = Arc::new(LeaseManager::new(store.clone(), "replica-test"));
    let runtime = Arc::new(
        WorkflowRuntime::new(store.clone(), leases, registry).with_config(
            RuntimeConfig::default()
                .with_lease_ttl(Duration::from_secs(2))
                .with_heartbeat_interval(Duration::from_millis(100))
                .with_handle_poll_interval(Duration::from_millis(10)),
        ),
    );
    let scheduler = PollScheduler::new(runtime.clone())
        .with_config(
            SchedulerConfig::default()
                .with_poll_interval(Duration::from_millis(20))
                .with_stale_after(Duration::from_millis(300)),
        )
        .start();
    (store, runtime, scheduler)
}

async fn wait_for_status(handle: &ExecutionHandle, want: ExecutionStatus, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let status = handle.status().await.unwrap();
        if status == want {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, stuck at {:?}",
            want,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Test workflows
// =============================================================================

/// Two memoized steps; counts how many times step bodies actually run
struct Arithmetic {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow for Arithmetic {
    const NAME: &'static str = "arithmetic";
    type Input = u32;
    type Output = u32;

    async fn run(&self, ctx: &WorkflowContext, input: u32) -> Result<u32, StepError> {
        let calls = Arc::clone(&self.calls);
        let doubled: u32 = ctx
            .step("double", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, WorkflowError>(input * 2)
            })
            .await?;

        let calls = Arc::clone(&self.calls);
        ctx.step("add-ten", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, WorkflowError>(doubled + 10)
        })
        .await
    }
}

/// Sleeps for a configurable time, then records one step
struct Sleeper {
    duration: Duration,
}

#[async_trait]
impl Workflow for Sleeper {
    const NAME: &'static str = "sleeper";
    type Input = ();
    type Output = bool;

    async fn run(&self, ctx: &WorkflowContext, _input: ()) -> Result<bool, StepError> {
        ctx.sleep(self.duration).await?;
        ctx.step("after-nap", || async { Ok::<_, WorkflowError>(true) })
            .await
    }
}

/// Waits for an `approval` signal and reports its verdict
struct Approval;

#[async_trait]
impl Workflow for Approval {
    const NAME: &'static str = "approval";
    type Input = ();
    type Output = bool;

    async fn run(&self, ctx: &WorkflowContext, _input: ()) -> Result<bool, StepError> {
        let payload = ctx.wait_for_signal("approval").await?;
        Ok(payload.get("approved").and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

/// Always fails inside its first step
struct Flaky {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow for Flaky {
    const NAME: &'static str = "flaky";
    type Input = ();
    type Output = ();

    async fn run(&self, ctx: &WorkflowContext, _input: ()) -> Result<(), StepError> {
        let calls = Arc::clone(&self.calls);
        ctx.step("work", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(WorkflowError::new("boom").with_code("E_BOOM"))
        })
        .await
    }
}

/// Starts an `arithmetic` child and returns its input untouched
struct Parent;

#[async_trait]
impl Workflow for Parent {
    const NAME: &'static str = "parent";
    type Input = u32;
    type Output = u32;

    async fn run(&self, ctx: &WorkflowContext, input: u32) -> Result<u32, StepError> {
        ctx.start_child::<Arithmetic>("child-arith", input).await?;
        Ok(input)
    }
}

// =============================================================================
// Workflow engine
// =============================================================================

#[test_log::test(tokio::test)]
async fn steps_run_to_completion() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkflowRegistry::new().with(Arithmetic {
        calls: calls.clone(),
    });
    let (_store, runtime, scheduler) = engine(registry).await;

    let handle = runtime.start::<Arithmetic>("arith-1", 5).await.unwrap();
    let result: u32 = handle.result_as(Duration::from_secs(5)).await.unwrap();

    assert_eq!(result, 20);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.status().await.unwrap(), ExecutionStatus::Completed);
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn start_is_idempotent_on_workflow_id() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkflowRegistry::new().with(Arithmetic {
        calls: calls.clone(),
    });
    let (store, runtime, scheduler) = engine(registry).await;

    let first = runtime.start::<Arithmetic>("arith-dup", 5).await.unwrap();
    // Different input on the second start is ignored: the stored execution wins
    let second = runtime.start::<Arithmetic>("arith-dup", 9999).await.unwrap();

    assert_eq!(first.execution_id(), second.execution_id());
    let a: u32 = first.result_as(Duration::from_secs(5)).await.unwrap();
    let b: u32 = second.result_as(Duration::from_secs(5)).await.unwrap();
    assert_eq!(a, 20);
    assert_eq!(b, 20);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.execution_count(), 1);
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn sleep_suspends_and_scheduler_resumes() {
    let registry = WorkflowRegistry::new().with(Sleeper {
        duration: Duration::from_millis(300),
    });
    let (_store, runtime, scheduler) = engine(registry).await;

    let started = Instant::now();
    let handle = runtime.start::<Sleeper>("nap-1", ()).await.unwrap();

    wait_for_status(&handle, ExecutionStatus::Sleeping, Duration::from_secs(2)).await;

    let result: bool = handle.result_as(Duration::from_secs(5)).await.unwrap();
    assert!(result);
    assert!(started.elapsed() >= Duration::from_millis(300));
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn signal_wakes_waiter_and_names_must_match() {
    let registry = WorkflowRegistry::new().with(Approval);
    let (store, runtime, scheduler) = engine(registry).await;

    let handle = runtime.start::<Approval>("approval-1", ()).await.unwrap();
    wait_for_status(&handle, ExecutionStatus::Sleeping, Duration::from_secs(2)).await;

    // A signal with the wrong name wakes the execution, which re-suspends
    store
        .deliver_signal(handle.execution_id(), "unrelated", json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.status().await.unwrap(), ExecutionStatus::Sleeping);

    runtime
        .signal("approval-1", "approval", json!({ "approved": true }))
        .await
        .unwrap();
    let result: bool = handle.result_as(Duration::from_secs(5)).await.unwrap();
    assert!(result);
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn cancel_lands_while_suspended() {
    let registry = WorkflowRegistry::new().with(Sleeper {
        duration: Duration::from_secs(600),
    });
    let (_store, runtime, scheduler) = engine(registry).await;

    let handle = runtime.start::<Sleeper>("nap-forever", ()).await.unwrap();
    wait_for_status(&handle, ExecutionStatus::Sleeping, Duration::from_secs(2)).await;

    assert!(runtime.cancel("nap-forever").await.unwrap());
    match handle.result(Duration::from_secs(5)).await {
        Err(DurableError::ExecutionCancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
    assert_eq!(handle.status().await.unwrap(), ExecutionStatus::Cancelled);

    // Terminal executions refuse further cancel requests
    assert!(!handle.cancel().await.unwrap());
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn failure_is_terminal_without_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkflowRegistry::new().with(Flaky {
        calls: calls.clone(),
    });
    let (_store, runtime, scheduler) = engine(registry).await;

    let handle = runtime.start::<Flaky>("flaky-1", ()).await.unwrap();
    match handle.result(Duration::from_secs(5)).await {
        Err(DurableError::ExecutionFailed(e)) => {
            assert_eq!(e.message, "boom");
            assert_eq!(e.code.as_deref(), Some("E_BOOM"));
        }
        other => panic!("expected failure, got {:?}", other.map(|_| ())),
    }

    // Give the scheduler time to (wrongly) pick it up again
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status().await.unwrap(), ExecutionStatus::Failed);
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn abandoned_execution_is_reclaimed_and_replayed_from_ledger() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkflowRegistry::new().with(Arithmetic {
        calls: calls.clone(),
    });
    let (store, runtime, scheduler) = engine(registry).await;

    // A row left `running` by a replica that died mid-replay, with one step
    // already committed. No task is driving it.
    let (record, created) = store
        .create_execution(NewExecution::new("arithmetic", "recover-1", json!(3)))
        .await
        .unwrap();
    assert!(created);
    store
        .record_step(record.id, "double", 0, json!(99))
        .await
        .unwrap();

    // Once the heartbeat goes stale the scheduler reclaims it; the committed
    // step is replayed from the ledger, not recomputed.
    let handle = runtime.handle("recover-1").await.unwrap();
    let result: u32 = handle.result_as(Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, 109);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn child_workflows_are_linked_and_driven() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkflowRegistry::new()
        .with(Parent)
        .with(Arithmetic {
            calls: calls.clone(),
        });
    let (store, runtime, scheduler) = engine(registry).await;

    let handle = runtime.start::<Parent>("parent-1", 4).await.unwrap();
    let parent_result: u32 = handle.result_as(Duration::from_secs(5)).await.unwrap();
    assert_eq!(parent_result, 4);

    let child = runtime.handle("child-arith").await.unwrap();
    let child_result: u32 = child.result_as(Duration::from_secs(5)).await.unwrap();
    assert_eq!(child_result, 18);

    let children = store.children(handle.execution_id()).await.unwrap();
    assert_eq!(children, vec![child.execution_id()]);
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn list_filters_by_status() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = WorkflowRegistry::new().with(Arithmetic {
        calls: calls.clone(),
    });
    let (_store, runtime, scheduler) = engine(registry).await;

    let a = runtime.start::<Arithmetic>("list-1", 1).await.unwrap();
    let b = runtime.start::<Arithmetic>("list-2", 2).await.unwrap();
    a.result(Duration::from_secs(5)).await.unwrap();
    b.result(Duration::from_secs(5)).await.unwrap();

    let all = runtime.list(ExecutionFilter::default()).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|e| e.workflow_id.as_str()).collect();
    assert!(ids.contains(&"list-1"));
    assert!(ids.contains(&"list-2"));

    let completed = runtime
        .list(ExecutionFilter::default().with_status(ExecutionStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);
    let running = runtime
        .list(ExecutionFilter::default().with_status(ExecutionStatus::Running))
        .await
        .unwrap();
    assert!(running.is_empty());
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn start_validates_inputs() {
    let registry = WorkflowRegistry::new().with(Approval);
    let (_store, runtime, scheduler) = engine(registry).await;

    match runtime.start::<Approval>("", ()).await {
        Err(DurableError::Validation(_)) => {}
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
    // Sleeper was never registered on this runtime
    match runtime.start::<Sleeper>("nap-1", ()).await {
        Err(DurableError::Validation(_)) => {}
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
    match runtime.handle("no-such-workflow").await {
        Err(DurableError::NotFound(_)) => {}
        other => panic!("expected not-found error, got {:?}", other.map(|_| ())),
    }
    scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn result_times_out_without_affecting_the_execution() {
    let registry = WorkflowRegistry::new().with(Sleeper {
        duration: Duration::from_secs(600),
    });
    let (_store, runtime, scheduler) = engine(registry).await;

    let handle = runtime.start::<Sleeper>("nap-2", ()).await.unwrap();
    match handle.result(Duration::from_millis(100)).await {
        Err(DurableError::Timeout { .. }) => {}
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
    wait_for_status(&handle, ExecutionStatus::Sleeping, Duration::from_secs(2)).await;
    scheduler.shutdown().await;
}

// =============================================================================
// Cron
// =============================================================================

fn cron_replica(
    store: &Arc<InMemoryDurableStore>,
    holder: &str,
) -> Arc<CronRuntime> {
    let leases = Arc::new(LeaseManager::new(store.clone(), holder));
    Arc::new(CronRuntime::new(store.clone(), leases))
}

#[test_log::test(tokio::test)]
async fn cron_tick_fires_on_exactly_one_replica() {
    let store = Arc::new(InMemoryDurableStore::new());
    let counter = Arc::new(AtomicU32::new(0));

    let mut replicas = Vec::new();
    for holder in ["replica-a", "replica-b", "replica-c"] {
        let cron = cron_replica(&store, holder);
        let counter = counter.clone();
        cron.register("nightly-report", "0 3 * * *", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), WorkflowError>(())
            }
        })
        .await
        .unwrap();
        replicas.push(cron);
    }

    // Force the job due, then let every replica race for the tick
    store
        .advance_cron_job("nightly-report", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    let now = Utc::now();
    for cron in &replicas {
        cron.run_due(now).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let history = store.cron_history("nightly-report", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CronExecutionStatus::Succeeded);

    let job = store.cron_job("nightly-report").await.unwrap().unwrap();
    assert!(job.next_run_at > now);
}

#[test_log::test(tokio::test)]
async fn cron_trigger_runs_immediately_and_records_history() {
    let store = Arc::new(InMemoryDurableStore::new());
    let cron = cron_replica(&store, "replica-a");
    let counter = Arc::new(AtomicU32::new(0));

    let handle = {
        let counter = counter.clone();
        cron.register("cleanup", "*/5 * * * *", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), WorkflowError>(())
            }
        })
        .await
        .unwrap()
    };

    handle.trigger().await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let history = handle.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CronExecutionStatus::Succeeded);
    assert!(history[0].finished_at.is_some());
}

#[test_log::test(tokio::test)]
async fn cron_handler_failure_is_recorded() {
    let store = Arc::new(InMemoryDurableStore::new());
    let cron = cron_replica(&store, "replica-a");

    let handle = cron
        .register("doomed", "0 0 * * *", || async {
            Err::<(), _>(WorkflowError::new("disk full"))
        })
        .await
        .unwrap();

    handle.trigger().await.unwrap();
    let history = handle.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CronExecutionStatus::Failed);
    assert!(history[0].error.as_deref().unwrap_or("").contains("disk full"));
}

#[test_log::test(tokio::test)]
async fn disabled_cron_job_never_fires() {
    let store = Arc::new(InMemoryDurableStore::new());
    let cron = cron_replica(&store, "replica-a");
    let counter = Arc::new(AtomicU32::new(0));

    let handle = {
        let counter = counter.clone();
        cron.register("paused", "* * * * *", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), WorkflowError>(())
            }
        })
        .await
        .unwrap()
    };

    handle.disable().await.unwrap();
    store
        .advance_cron_job("paused", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    cron.run_due(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    handle.enable().await.unwrap();
    cron.run_due(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn cron_rejects_malformed_schedules() {
    let store = Arc::new(InMemoryDurableStore::new());
    let cron = cron_replica(&store, "replica-a");

    match cron.register("bad", "not a cron", || async { Ok(()) }).await {
        Err(DurableError::InvalidSchedule(_)) => {}
        other => panic!("expected schedule error, got {:?}", other.err()),
    }
    match cron.register("never", "0 0 31 2 *", || async { Ok(()) }).await {
        Err(DurableError::Validation(_)) => {}
        other => panic!("expected validation error, got {:?}", other.err()),
    }
}
