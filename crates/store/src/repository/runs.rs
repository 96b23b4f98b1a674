//! Run repository functions.
//!
//! Every mutation runs in a single transaction on the writer pool; run ids
//! are allocated inside the same transaction that inserts the row, so they
//! are monotonic per workflow with no duplicates.

use chrono::{DateTime, Utc};

use crate::models::{RunCounters, RunRow, RunStatus, Trigger};
use crate::{Store, StoreError};

/// Create a new run in RUNNING state and return its id (per-workflow
/// autoincrement).
pub async fn create_run(
    store: &Store,
    workflow_name: &str,
    trigger: Trigger,
    start_time: DateTime<Utc>,
    variables_json: &str,
    runbook_digest: &str,
) -> Result<i64, StoreError> {
    let mut tx = store.writer().begin().await?;

    let (run_id,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(run_id), 0) + 1 FROM runs WHERE workflow_name = ?",
    )
    .bind(workflow_name)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO runs (workflow_name, run_id, start_time, end_time, status,
                          "trigger", nodes_ok, nodes_nok, nodes_skipped,
                          variables_json, runbook_digest)
        VALUES (?, ?, ?, NULL, ?, ?, 0, 0, 0, ?, ?)
        "#,
    )
    .bind(workflow_name)
    .bind(run_id)
    .bind(start_time)
    .bind(RunStatus::Running.to_string())
    .bind(trigger.to_string())
    .bind(variables_json)
    .bind(runbook_digest)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(run_id)
}

/// Fetch a run by id.
pub async fn get_run(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
) -> Result<Option<RunRow>, StoreError> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT workflow_name, run_id, start_time, end_time, status, "trigger",
               nodes_ok, nodes_nok, nodes_skipped, variables_json, runbook_digest
        FROM runs
        WHERE workflow_name = ? AND run_id = ?
        "#,
    )
    .bind(workflow_name)
    .bind(run_id)
    .fetch_optional(store.reader())
    .await?;

    Ok(row)
}

/// Fetch the most recent run for a workflow, if any.
pub async fn latest_run(
    store: &Store,
    workflow_name: &str,
) -> Result<Option<RunRow>, StoreError> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT workflow_name, run_id, start_time, end_time, status, "trigger",
               nodes_ok, nodes_nok, nodes_skipped, variables_json, runbook_digest
        FROM runs
        WHERE workflow_name = ?
        ORDER BY run_id DESC
        LIMIT 1
        "#,
    )
    .bind(workflow_name)
    .fetch_optional(store.reader())
    .await?;

    Ok(row)
}

/// List all runs for a workflow, newest first.
pub async fn list_runs(store: &Store, workflow_name: &str) -> Result<Vec<RunRow>, StoreError> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT workflow_name, run_id, start_time, end_time, status, "trigger",
               nodes_ok, nodes_nok, nodes_skipped, variables_json, runbook_digest
        FROM runs
        WHERE workflow_name = ?
        ORDER BY run_id DESC
        "#,
    )
    .bind(workflow_name)
    .fetch_all(store.reader())
    .await?;

    Ok(rows)
}

/// All runs for a workflow still marked RUNNING (orphan candidates).
pub async fn running_runs(
    store: &Store,
    workflow_name: &str,
) -> Result<Vec<RunRow>, StoreError> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT workflow_name, run_id, start_time, end_time, status, "trigger",
               nodes_ok, nodes_nok, nodes_skipped, variables_json, runbook_digest
        FROM runs
        WHERE workflow_name = ? AND status = 'running'
        ORDER BY run_id
        "#,
    )
    .bind(workflow_name)
    .fetch_all(store.reader())
    .await?;

    Ok(rows)
}

/// Update a run's status, counters and (optionally) end time.
pub async fn update_run_status(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    status: RunStatus,
    counters: RunCounters,
    end_time: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?, nodes_ok = ?, nodes_nok = ?, nodes_skipped = ?, end_time = ?
        WHERE workflow_name = ? AND run_id = ?
        "#,
    )
    .bind(status.to_string())
    .bind(counters.ok)
    .bind(counters.nok)
    .bind(counters.skipped)
    .bind(end_time)
    .bind(workflow_name)
    .bind(run_id)
    .execute(store.writer())
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::RunNotFound {
            workflow_name: workflow_name.to_string(),
            run_id,
        });
    }
    Ok(())
}

/// Overwrite only the status column. Used by the `set-status` escape hatch
/// to rehabilitate orphaned RUNNING rows.
pub async fn set_run_status(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    status: RunStatus,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE runs SET status = ? WHERE workflow_name = ? AND run_id = ?",
    )
    .bind(status.to_string())
    .bind(workflow_name)
    .bind(run_id)
    .execute(store.writer())
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::RunNotFound {
            workflow_name: workflow_name.to_string(),
            run_id,
        });
    }
    Ok(())
}

/// Reopen an aborted run for resume: status back to RUNNING, trigger set to
/// `resume`, end_time cleared.
pub async fn mark_resumed(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'running', "trigger" = 'resume', end_time = NULL
        WHERE workflow_name = ? AND run_id = ?
        "#,
    )
    .bind(workflow_name)
    .bind(run_id)
    .execute(store.writer())
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::RunNotFound {
            workflow_name: workflow_name.to_string(),
            run_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_ids_autoincrement_per_workflow() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        let a1 = create_run(&store, "alpha", Trigger::Run, now, "{}", "d1")
            .await
            .unwrap();
        let a2 = create_run(&store, "alpha", Trigger::Run, now, "{}", "d1")
            .await
            .unwrap();
        let b1 = create_run(&store, "beta", Trigger::Run, now, "{}", "d2")
            .await
            .unwrap();

        assert_eq!(a1, 1);
        assert_eq!(a2, 2);
        assert_eq!(b1, 1, "ids are per workflow, not global");
    }

    #[tokio::test]
    async fn latest_run_returns_highest_id() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        create_run(&store, "wf", Trigger::Run, now, "{}", "d").await.unwrap();
        create_run(&store, "wf", Trigger::Run, now, "{}", "d").await.unwrap();

        let latest = latest_run(&store, "wf").await.unwrap().unwrap();
        assert_eq!(latest.run_id, 2);
        assert_eq!(latest.run_status().unwrap(), RunStatus::Running);
    }

    #[tokio::test]
    async fn update_and_set_status() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let id = create_run(&store, "wf", Trigger::Run, now, "{}", "d")
            .await
            .unwrap();

        let counters = RunCounters { ok: 2, nok: 0, skipped: 1 };
        update_run_status(&store, "wf", id, RunStatus::Ok, counters, Some(now))
            .await
            .unwrap();

        let run = get_run(&store, "wf", id).await.unwrap().unwrap();
        assert_eq!(run.run_status().unwrap(), RunStatus::Ok);
        assert_eq!(run.counters(), counters);
        assert!(run.end_time.is_some());

        set_run_status(&store, "wf", id, RunStatus::Aborted).await.unwrap();
        let run = get_run(&store, "wf", id).await.unwrap().unwrap();
        assert_eq!(run.run_status().unwrap(), RunStatus::Aborted);
        // set_run_status touches only the status column.
        assert_eq!(run.counters(), counters);
    }

    #[tokio::test]
    async fn missing_run_errors() {
        let store = Store::in_memory().await.unwrap();
        assert!(get_run(&store, "wf", 1).await.unwrap().is_none());
        assert!(matches!(
            set_run_status(&store, "wf", 1, RunStatus::Ok).await,
            Err(StoreError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn mark_resumed_reopens_run() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let id = create_run(&store, "wf", Trigger::Run, now, "{}", "d")
            .await
            .unwrap();
        update_run_status(&store, "wf", id, RunStatus::Aborted, RunCounters::default(), Some(now))
            .await
            .unwrap();

        mark_resumed(&store, "wf", id).await.unwrap();
        let run = get_run(&store, "wf", id).await.unwrap().unwrap();
        assert_eq!(run.run_status().unwrap(), RunStatus::Running);
        assert_eq!(run.run_trigger().unwrap(), Trigger::Resume);
        assert!(run.end_time.is_none());
    }
}
