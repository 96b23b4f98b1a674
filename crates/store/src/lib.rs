//! `store` crate — pure persistence layer.
//!
//! Provides the SQLite pool, typed row structs, and repository functions for
//! the `runs` and `executions` tables. No business logic lives here; the
//! engine crate owns every decision about *when* rows are written.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::StoreError;
pub use models::{
    ExecutionRow, NodeStatus, OperatorDecision, RunCounters, RunRow, RunStatus, Trigger,
};
pub use pool::Store;
