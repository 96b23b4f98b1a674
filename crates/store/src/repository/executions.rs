//! Node-attempt repository functions.
//!
//! An attempt's lifecycle is two writes: `begin_attempt` inserts a PENDING
//! row (making long-running commands visible), `finish_attempt` closes it
//! with a terminal status. A crash between the two leaves a PENDING row —
//! that is the orphan marker later invocations look for.

use chrono::{DateTime, Utc};

use crate::models::{ExecutionRow, NodeStatus, OperatorDecision};
use crate::{Store, StoreError};

const SELECT_COLUMNS: &str = "workflow_name, run_id, node_id, attempt, start_time, \
     end_time, status, operator_decision, result_text, exit_code, exception, \
     stdout, stderr, duration_ms";

/// Terminal fields written by [`finish_attempt`].
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub status: NodeStatus,
    pub operator_decision: OperatorDecision,
    pub result_text: Option<String>,
    pub exit_code: Option<i64>,
    pub exception: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Allocate the next attempt number for a node and insert its PENDING row.
///
/// Allocation and insert share one transaction, so attempt numbers per
/// `(run, node)` are dense 1..N even under concurrent engine bugs.
pub async fn begin_attempt(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    node_id: &str,
    start_time: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let mut tx = store.writer().begin().await?;

    let (attempt,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(attempt), 0) + 1 FROM executions \
         WHERE workflow_name = ? AND run_id = ? AND node_id = ?",
    )
    .bind(workflow_name)
    .bind(run_id)
    .bind(node_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO executions (workflow_name, run_id, node_id, attempt, \
                                 start_time, status, operator_decision) \
         VALUES (?, ?, ?, ?, ?, 'pending', 'none')",
    )
    .bind(workflow_name)
    .bind(run_id)
    .bind(node_id)
    .bind(attempt)
    .bind(start_time)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(attempt)
}

/// Terminal update of an attempt row.
pub async fn finish_attempt(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    node_id: &str,
    attempt: i64,
    end_time: DateTime<Utc>,
    outcome: &AttemptOutcome,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE executions \
         SET end_time = ?, status = ?, operator_decision = ?, result_text = ?, \
             exit_code = ?, exception = ?, stdout = ?, stderr = ?, duration_ms = ? \
         WHERE workflow_name = ? AND run_id = ? AND node_id = ? AND attempt = ?",
    )
    .bind(end_time)
    .bind(outcome.status.to_string())
    .bind(outcome.operator_decision.to_string())
    .bind(&outcome.result_text)
    .bind(outcome.exit_code)
    .bind(&outcome.exception)
    .bind(&outcome.stdout)
    .bind(&outcome.stderr)
    .bind(outcome.duration_ms)
    .bind(workflow_name)
    .bind(run_id)
    .bind(node_id)
    .bind(attempt)
    .execute(store.writer())
    .await?;

    Ok(())
}

/// Append an already-terminal row in one insert (operator skips, `when`
/// skips, abort markers). Returns the attempt number it was given.
pub async fn append_terminal(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    node_id: &str,
    time: DateTime<Utc>,
    status: NodeStatus,
    decision: OperatorDecision,
    result_text: Option<&str>,
) -> Result<i64, StoreError> {
    let mut tx = store.writer().begin().await?;

    let (attempt,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(attempt), 0) + 1 FROM executions \
         WHERE workflow_name = ? AND run_id = ? AND node_id = ?",
    )
    .bind(workflow_name)
    .bind(run_id)
    .bind(node_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO executions (workflow_name, run_id, node_id, attempt, \
                                 start_time, end_time, status, operator_decision, \
                                 result_text, duration_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(workflow_name)
    .bind(run_id)
    .bind(node_id)
    .bind(attempt)
    .bind(time)
    .bind(time)
    .bind(status.to_string())
    .bind(decision.to_string())
    .bind(result_text)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(attempt)
}

/// The highest-attempt row for a node within a run, if any.
pub async fn latest_attempt(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    node_id: &str,
) -> Result<Option<ExecutionRow>, StoreError> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM executions \
         WHERE workflow_name = ? AND run_id = ? AND node_id = ? \
         ORDER BY attempt DESC LIMIT 1"
    );
    let row = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(workflow_name)
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(store.reader())
        .await?;

    Ok(row)
}

/// All attempt rows for a run, ordered by `(node_id, attempt)`.
pub async fn executions_for(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
) -> Result<Vec<ExecutionRow>, StoreError> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM executions \
         WHERE workflow_name = ? AND run_id = ? \
         ORDER BY node_id, attempt"
    );
    let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(workflow_name)
        .bind(run_id)
        .fetch_all(store.reader())
        .await?;

    Ok(rows)
}

/// Close every still-PENDING row of a run as NOK with the given exception.
/// Used on forced cancellation; returns the number of rows closed.
pub async fn close_open_attempts(
    store: &Store,
    workflow_name: &str,
    run_id: i64,
    end_time: DateTime<Utc>,
    exception: &str,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE executions \
         SET end_time = ?, status = 'nok', exception = ? \
         WHERE workflow_name = ? AND run_id = ? AND status = 'pending'",
    )
    .bind(end_time)
    .bind(exception)
    .bind(workflow_name)
    .bind(run_id)
    .execute(store.writer())
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;
    use crate::repository::runs;

    async fn store_with_run() -> (Store, i64) {
        let store = Store::in_memory().await.unwrap();
        let id = runs::create_run(&store, "wf", Trigger::Run, Utc::now(), "{}", "d")
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn attempts_are_dense_from_one() {
        let (store, run_id) = store_with_run().await;

        for expected in 1..=3 {
            let n = begin_attempt(&store, "wf", run_id, "step", Utc::now())
                .await
                .unwrap();
            assert_eq!(n, expected);
            finish_attempt(
                &store,
                "wf",
                run_id,
                "step",
                n,
                Utc::now(),
                &AttemptOutcome {
                    status: NodeStatus::Nok,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let rows = executions_for(&store, "wf", run_id).await.unwrap();
        let attempts: Vec<i64> = rows.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn latest_attempt_is_authoritative() {
        let (store, run_id) = store_with_run().await;

        let a1 = begin_attempt(&store, "wf", run_id, "step", Utc::now())
            .await
            .unwrap();
        finish_attempt(
            &store,
            "wf",
            run_id,
            "step",
            a1,
            Utc::now(),
            &AttemptOutcome {
                status: NodeStatus::Nok,
                exception: Some("boom".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let a2 = begin_attempt(&store, "wf", run_id, "step", Utc::now())
            .await
            .unwrap();
        finish_attempt(
            &store,
            "wf",
            run_id,
            "step",
            a2,
            Utc::now(),
            &AttemptOutcome {
                status: NodeStatus::Ok,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let latest = latest_attempt(&store, "wf", run_id, "step")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.node_status().unwrap(), NodeStatus::Ok);
    }

    #[tokio::test]
    async fn append_terminal_allocates_next_attempt() {
        let (store, run_id) = store_with_run().await;

        let a1 = begin_attempt(&store, "wf", run_id, "step", Utc::now())
            .await
            .unwrap();
        finish_attempt(
            &store,
            "wf",
            run_id,
            "step",
            a1,
            Utc::now(),
            &AttemptOutcome {
                status: NodeStatus::Nok,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let n = append_terminal(
            &store,
            "wf",
            run_id,
            "step",
            Utc::now(),
            NodeStatus::Skipped,
            OperatorDecision::Skip,
            Some("skipped by operator"),
        )
        .await
        .unwrap();
        assert_eq!(n, 2);

        let latest = latest_attempt(&store, "wf", run_id, "step")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.node_status().unwrap(), NodeStatus::Skipped);
        assert_eq!(latest.decision().unwrap(), OperatorDecision::Skip);
    }

    #[tokio::test]
    async fn close_open_attempts_only_touches_pending() {
        let (store, run_id) = store_with_run().await;

        let a1 = begin_attempt(&store, "wf", run_id, "done", Utc::now())
            .await
            .unwrap();
        finish_attempt(
            &store,
            "wf",
            run_id,
            "done",
            a1,
            Utc::now(),
            &AttemptOutcome {
                status: NodeStatus::Ok,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        begin_attempt(&store, "wf", run_id, "stuck", Utc::now())
            .await
            .unwrap();

        let closed = close_open_attempts(&store, "wf", run_id, Utc::now(), "cancelled")
            .await
            .unwrap();
        assert_eq!(closed, 1);

        let stuck = latest_attempt(&store, "wf", run_id, "stuck")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stuck.node_status().unwrap(), NodeStatus::Nok);
        assert_eq!(stuck.exception.as_deref(), Some("cancelled"));

        let done = latest_attempt(&store, "wf", run_id, "done")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.node_status().unwrap(), NodeStatus::Ok);
    }
}
