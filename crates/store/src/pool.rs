//! SQLite pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. `Store` holds a multi-connection
//! reader pool for concurrent reads (info/show commands while a run is live)
//! and a single-connection writer pool: the writer pool *is* the write
//! serialization the engine relies on.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use tracing::debug;

use crate::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    workflow_name  TEXT    NOT NULL,
    run_id         INTEGER NOT NULL,
    start_time     TEXT    NOT NULL,
    end_time       TEXT,
    status         TEXT    NOT NULL,
    "trigger"      TEXT    NOT NULL,
    nodes_ok       INTEGER NOT NULL DEFAULT 0,
    nodes_nok      INTEGER NOT NULL DEFAULT 0,
    nodes_skipped  INTEGER NOT NULL DEFAULT 0,
    variables_json TEXT    NOT NULL DEFAULT '{}',
    runbook_digest TEXT    NOT NULL DEFAULT '',
    PRIMARY KEY (workflow_name, run_id)
);

CREATE TABLE IF NOT EXISTS executions (
    workflow_name     TEXT    NOT NULL,
    run_id            INTEGER NOT NULL,
    node_id           TEXT    NOT NULL,
    attempt           INTEGER NOT NULL,
    start_time        TEXT    NOT NULL,
    end_time          TEXT,
    status            TEXT    NOT NULL,
    operator_decision TEXT    NOT NULL DEFAULT 'none',
    result_text       TEXT,
    exit_code         INTEGER,
    exception         TEXT,
    stdout            TEXT,
    stderr            TEXT,
    duration_ms       INTEGER,
    PRIMARY KEY (workflow_name, run_id, node_id, attempt),
    FOREIGN KEY (workflow_name, run_id) REFERENCES runs (workflow_name, run_id)
);
"#;

/// Shared handle to the state database.
#[derive(Clone)]
pub struct Store {
    reader: SqlitePool,
    writer: SqlitePool,
}

impl Store {
    /// Open (or create) the state database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let base_opts = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        // Schema must exist before the read-only pool opens.
        sqlx::raw_sql(SCHEMA).execute(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(base_opts.read_only(true))
            .await?;

        debug!(path = %path.display(), "state store opened");
        Ok(Self { reader, writer })
    }

    /// Open an in-memory database (for tests).
    ///
    /// A single connection backs both pools — dropping it would drop the
    /// database, so the pool is pinned to exactly one live connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self {
            reader: pool.clone(),
            writer: pool,
        })
    }

    /// Pool for SELECT queries.
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Single-connection pool for serialized writes.
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }
}
