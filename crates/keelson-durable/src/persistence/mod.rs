//! Persistence layer for the durable execution substrate
//!
//! - [`store`]: the `DurableStore` trait and row types
//! - [`postgres`]: production PostgreSQL implementation
//! - [`memory`]: in-memory implementation for testing

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryDurableStore;
pub use postgres::PostgresDurableStore;
pub use store::{
    CronExecutionRecord, CronExecutionStatus, CronJobRecord, DurableStore, ExecutionFilter,
    ExecutionRecord, ExecutionStatus, NewExecution, StepRecord, StoreError,
};
