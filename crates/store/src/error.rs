//! Typed error type for the store crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("run not found: {workflow_name}/{run_id}")]
    RunNotFound {
        workflow_name: String,
        run_id: i64,
    },

    #[error("cannot create state directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Decode(String),
}
