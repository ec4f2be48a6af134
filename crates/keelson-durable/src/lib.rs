//! # Keelson Durable
//!
//! A PostgreSQL-backed durable execution substrate: replay-based workflows
//! and a distributed cron scheduler over one shared store.
//!
//! ## Features
//!
//! - **Replay-based workflows**: handlers re-run from the top after any
//!   crash; a step ledger short-circuits completed steps so effects run once
//! - **Durable timers and signals**: `sleep` and `wait_for_signal` suspend
//!   without holding a thread, for minutes or months
//! - **Fenced leases**: per-execution TTL leases keep replays single-writer
//!   across replicas, with fence tokens guarding against zombie holders
//! - **Distributed cron**: identical replicas race per-tick leases so each
//!   schedule fires exactly once, with history and manual triggers
//! - **No coordinator**: the relational store is the only shared medium;
//!   replicas never talk to each other
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRuntime                         │
//! │  (starts executions, replays handlers under a fenced lease) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableStore                           │
//! │  (PostgreSQL: workflows, steps, signals, cron, leases)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 PollScheduler + CronRuntime                  │
//! │  (per replica: wakes due sleepers, fires due cron ticks)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keelson_durable::prelude::*;
//!
//! struct Onboarding;
//!
//! #[async_trait]
//! impl Workflow for Onboarding {
//!     const NAME: &'static str = "onboarding";
//!     type Input = SignupRequest;
//!     type Output = SignupResult;
//!
//!     async fn run(
//!         &self,
//!         ctx: &WorkflowContext,
//!         input: SignupRequest,
//!     ) -> Result<SignupResult, StepError> {
//!         let account = ctx.step("create-account", || create_account(&input)).await?;
//!         ctx.sleep(Duration::from_secs(24 * 3600)).await?;
//!         ctx.step("send-followup", || send_followup(&account)).await?;
//!         Ok(SignupResult { account_id: account.id })
//!     }
//! }
//! ```

pub mod cron;
pub mod engine;
pub mod error;
pub mod lease;
pub mod persistence;
pub mod workflow;

pub use crate::cron::{CronHandle, CronRuntime, Schedule};
pub use crate::engine::{PollScheduler, WorkflowRuntime};
pub use crate::error::DurableError;
pub use crate::lease::LeaseManager;
pub use crate::persistence::{DurableStore, InMemoryDurableStore, PostgresDurableStore};
pub use crate::workflow::{Workflow, WorkflowContext, WorkflowRegistry};

/// Prelude for common imports
pub mod prelude {
    pub use crate::cron::{CronConfig, CronHandle, CronRuntime, Schedule};
    pub use crate::engine::{
        PollScheduler, RuntimeConfig, SchedulerConfig, SchedulerHandle, WorkflowRuntime,
    };
    pub use crate::error::DurableError;
    pub use crate::lease::LeaseManager;
    pub use crate::persistence::{
        DurableStore, ExecutionFilter, ExecutionStatus, InMemoryDurableStore,
        PostgresDurableStore, StoreError,
    };
    pub use crate::workflow::{
        ExecutionHandle, StepError, Workflow, WorkflowContext, WorkflowError, WorkflowRegistry,
    };
    pub use async_trait::async_trait;
}
