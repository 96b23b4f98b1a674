//! The execution engine.
//!
//! `Engine` owns the run-level state machine:
//! 1. Validates the plan and renders every templated node field.
//! 2. Creates the run row, then loops: compute the ready set from edge
//!    satisfaction, gate on skip flags and `when` conditions, dispatch
//!    ready nodes (serially or in parallel), record every attempt.
//! 3. On NOK, runs the retry/skip/abort resolution loop.
//! 4. Closes the run with counters derived from the latest attempt rows.
//!
//! Descendants of a failed node that are not wired through a `:failure`
//! edge become PRUNED — an in-memory terminal that never touches the store
//! and surfaces as "not run".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use runners::{
    CommandPayload, FunctionPayload, ManualPayload, NodePayload, Outcome, RunContext, Runner,
};
use store::repository::executions::{self, AttemptOutcome};
use store::repository::runs;
use store::{
    ExecutionRow, NodeStatus, OperatorDecision, RunCounters, RunStatus, Store, StoreError,
    Trigger,
};
use template::eval::{NullProbe, RenderContext, StatusProbe};

use crate::error::{EngineError, StateError};
use crate::model::{NodeDescriptor, NodeKind, ResolvedVariables, Runbook};
use crate::plan::{self, Edge, EdgeCondition, Plan};
use crate::vars;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine. Threaded explicitly through constructors;
/// there is no global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum retries per failed node (attempts = retries + 1).
    pub max_retries: u32,
    /// Default per-node timeout for Command and Function nodes.
    pub default_timeout_secs: u64,
    /// Timeout for operator interaction (Manual nodes, failure prompts).
    pub interactive_timeout_secs: u64,
    /// Start every ready node concurrently instead of one per tick.
    pub parallel_execution: bool,
    /// Consult the interactor on failures; off means auto-retry, then
    /// forced skip (non-critical) or run NOK (critical).
    pub interactive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_timeout_secs: 300,
            interactive_timeout_secs: 300,
            parallel_execution: false,
            interactive: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Interactor port
// ---------------------------------------------------------------------------

/// What the operator can do with a failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry,
    Skip,
    Abort,
}

/// Everything the interactor needs to present a failure.
pub struct FailureContext<'a> {
    pub node: &'a NodeDescriptor,
    /// Attempt number that just failed.
    pub attempt: i64,
    pub max_retries: u32,
    pub can_retry: bool,
    pub can_skip: bool,
    pub exception: Option<&'a str>,
    pub stderr: Option<&'a str>,
    pub exit_code: Option<i64>,
}

/// Port for the retry/skip/abort conversation.
#[async_trait]
pub trait Interactor: Send + Sync {
    async fn on_failure(&self, ctx: FailureContext<'_>) -> FailureDecision;
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// One runner per node kind.
pub struct RunnerSet {
    pub manual: Arc<dyn Runner>,
    pub command: Arc<dyn Runner>,
    pub function: Arc<dyn Runner>,
}

impl RunnerSet {
    /// Same runner for every kind; used by tests with `MockRunner`.
    pub fn uniform(runner: Arc<dyn Runner>) -> Self {
        Self {
            manual: Arc::clone(&runner),
            command: Arc::clone(&runner),
            function: runner,
        }
    }

    fn for_kind(&self, kind: &NodeKind) -> Arc<dyn Runner> {
        match kind {
            NodeKind::Manual => Arc::clone(&self.manual),
            NodeKind::Command { .. } => Arc::clone(&self.command),
            NodeKind::Function { .. } => Arc::clone(&self.function),
        }
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Final state of a driven run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow_name: String,
    pub run_id: i64,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Nodes that never became eligible (pruned or left pending).
    pub not_run: Vec<String>,
}

impl RunReport {
    /// Exit-code convention: 0 OK, 1 NOK, 2 ABORTED.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Ok => 0,
            RunStatus::Nok => 1,
            RunStatus::Aborted | RunStatus::Running => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// In-memory node status during dispatch. `Pruned` never reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateStatus {
    Pending,
    Ok,
    Nok,
    Skipped,
    Pruned,
}

/// How a dispatched node ended.
enum NodeEnd {
    Ok,
    /// `expected` when a downstream `:failure` edge consumes the failure
    /// (NOK is a branch, not a problem). Unexpected NOK only happens on a
    /// critical node with retries exhausted.
    Nok { expected: bool },
    Skipped,
    Aborted,
    Cancelled,
}

struct RunProbe<'a> {
    plan: &'a Plan,
    gate: &'a [GateStatus],
}

impl StatusProbe for RunProbe<'_> {
    fn has_succeeded(&self, node_id: &str) -> bool {
        self.plan
            .index_of(node_id)
            .is_some_and(|i| self.gate[i] == GateStatus::Ok)
    }

    fn has_failed(&self, node_id: &str) -> bool {
        self.plan
            .index_of(node_id)
            .is_some_and(|i| self.gate[i] == GateStatus::Nok)
    }

    fn has_run(&self, node_id: &str) -> bool {
        self.plan
            .index_of(node_id)
            .is_some_and(|i| matches!(self.gate[i], GateStatus::Ok | GateStatus::Nok))
    }

    fn is_skipped(&self, node_id: &str) -> bool {
        self.plan
            .index_of(node_id)
            .is_some_and(|i| self.gate[i] == GateStatus::Skipped)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    store: Store,
    runners: RunnerSet,
    interactor: Arc<dyn Interactor>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        store: Store,
        runners: RunnerSet,
        interactor: Arc<dyn Interactor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            runners,
            interactor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally-owned cancellation token (SIGINT wiring).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a fresh run. Plan validation and field rendering happen before
    /// the run row is created; their errors leave no trace in the store.
    #[instrument(skip_all, fields(workflow = %runbook.workflow_name()))]
    pub async fn start(
        &self,
        runbook: &Runbook,
        variables: ResolvedVariables,
    ) -> Result<RunReport, EngineError> {
        let plan = plan::build(runbook)?;
        let payloads = self.render_payloads(runbook, &variables)?;
        let variables_json = serde_json::to_string(&variables)?;

        let workflow = runbook.workflow_name();
        let run_id = runs::create_run(
            &self.store,
            workflow,
            Trigger::Run,
            Utc::now(),
            &variables_json,
            &runbook.digest,
        )
        .await?;
        info!(run_id, "run started");

        let gate = vec![GateStatus::Pending; runbook.nodes.len()];
        self.guarded_drive(runbook, &plan, &payloads, &variables, run_id, gate)
            .await
    }

    /// Resume an aborted run. No new run row; new attempts append under the
    /// existing run.
    #[instrument(skip_all, fields(workflow = %runbook.workflow_name()))]
    pub async fn resume(
        &self,
        runbook: &Runbook,
        run_id: Option<i64>,
        overlay: ResolvedVariables,
    ) -> Result<RunReport, EngineError> {
        let workflow = runbook.workflow_name();

        let run = match run_id {
            Some(id) => runs::get_run(&self.store, workflow, id).await?.ok_or(
                StoreError::RunNotFound {
                    workflow_name: workflow.to_string(),
                    run_id: id,
                },
            )?,
            None => runs::latest_run(&self.store, workflow).await?.ok_or(
                StoreError::RunNotFound {
                    workflow_name: workflow.to_string(),
                    run_id: 0,
                },
            )?,
        };

        match run.run_status()? {
            RunStatus::Aborted => {}
            RunStatus::Ok => return Err(StateError::NotResumableOk.into()),
            RunStatus::Nok => return Err(StateError::NotResumableNok.into()),
            RunStatus::Running => return Err(StateError::NotResumableRunning.into()),
        }

        if run.runbook_digest != runbook.digest {
            warn!(
                run_id = run.run_id,
                "runbook changed since this run started; resuming against the current file"
            );
        }

        // Snapshot first, caller overlays on top, then re-validate.
        let mut variables: ResolvedVariables = serde_json::from_str(&run.variables_json)?;
        variables.extend(overlay);
        vars::validate(&runbook.variables, &mut variables)?;

        let plan = plan::build(runbook)?;
        let payloads = self.render_payloads(runbook, &variables)?;

        // Seed node gates from the latest attempts: OK/SKIPPED stay
        // terminal, NOK and PENDING become runnable again.
        let mut gate = vec![GateStatus::Pending; runbook.nodes.len()];
        for (i, node) in runbook.nodes.iter().enumerate() {
            if let Some(row) =
                executions::latest_attempt(&self.store, workflow, run.run_id, &node.id).await?
            {
                gate[i] = match row.node_status()? {
                    NodeStatus::Ok => GateStatus::Ok,
                    NodeStatus::Skipped => GateStatus::Skipped,
                    NodeStatus::Nok | NodeStatus::Pending => GateStatus::Pending,
                };
            }
        }

        runs::mark_resumed(&self.store, workflow, run.run_id).await?;
        info!(run_id = run.run_id, "run resumed");

        self.guarded_drive(runbook, &plan, &payloads, &variables, run.run_id, gate)
            .await
    }

    /// Drive the dispatch loop; on a store failure mid-run, best-effort
    /// transition the run to ABORTED before surfacing the error.
    async fn guarded_drive(
        &self,
        runbook: &Runbook,
        plan: &Plan,
        payloads: &[NodePayload],
        variables: &ResolvedVariables,
        run_id: i64,
        gate: Vec<GateStatus>,
    ) -> Result<RunReport, EngineError> {
        match self
            .drive(runbook, plan, payloads, variables, run_id, gate)
            .await
        {
            Ok(report) => Ok(report),
            Err(e) => {
                if matches!(e, EngineError::Store(_)) {
                    let _ = runs::set_run_status(
                        &self.store,
                        runbook.workflow_name(),
                        run_id,
                        RunStatus::Aborted,
                    )
                    .await;
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        runbook: &Runbook,
        plan: &Plan,
        payloads: &[NodePayload],
        variables: &ResolvedVariables,
        run_id: i64,
        mut gate: Vec<GateStatus>,
    ) -> Result<RunReport, EngineError> {
        let workflow = runbook.workflow_name();
        let mut aborted = false;
        let mut critical_failed = false;

        loop {
            if self.cancel.is_cancelled() {
                aborted = true;
                break;
            }

            propagate_prunes(plan, &mut gate);
            let ready = ready_nodes(plan, &gate);
            if ready.is_empty() {
                break;
            }

            let batch: Vec<usize> = if self.config.parallel_execution {
                ready
            } else {
                vec![ready[0]]
            };

            // Skip-request and `when` gates, in plan order.
            let mut to_start = Vec::new();
            for idx in batch {
                let node = &runbook.nodes[idx];

                if node.skip {
                    executions::append_terminal(
                        &self.store,
                        workflow,
                        run_id,
                        &node.id,
                        Utc::now(),
                        NodeStatus::Skipped,
                        OperatorDecision::None,
                        Some("skip requested in runbook"),
                    )
                    .await?;
                    gate[idx] = GateStatus::Skipped;
                    info!(node_id = %node.id, "node skipped (runbook flag)");
                    continue;
                }

                if let Some(when) = &node.when {
                    match self.eval_when(when, variables, plan, &gate) {
                        Ok(true) => {}
                        Ok(false) => {
                            executions::append_terminal(
                                &self.store,
                                workflow,
                                run_id,
                                &node.id,
                                Utc::now(),
                                NodeStatus::Skipped,
                                OperatorDecision::None,
                                Some(&format!("condition not met: {when}")),
                            )
                            .await?;
                            gate[idx] = GateStatus::Skipped;
                            info!(node_id = %node.id, "node skipped (condition)");
                            continue;
                        }
                        Err(e) => {
                            // Fail open: a broken condition must not wedge
                            // the run.
                            warn!(node_id = %node.id, error = %e, "when condition failed to evaluate; executing node");
                        }
                    }
                }

                to_start.push(idx);
            }

            if to_start.is_empty() {
                self.persist_progress(workflow, run_id).await?;
                continue;
            }

            if to_start.len() == 1 {
                let idx = to_start[0];
                let end = self
                    .run_node(workflow, run_id, runbook, idx, plan, &payloads[idx])
                    .await?;
                apply_end(idx, end, &mut gate, &mut aborted, &mut critical_failed);
            } else {
                self.run_batch(
                    workflow,
                    run_id,
                    runbook,
                    plan,
                    payloads,
                    &to_start,
                    &mut gate,
                    &mut aborted,
                    &mut critical_failed,
                )
                .await?;
            }

            // Write-ahead of progress: counters land before the next tick
            // dispatches anything.
            self.persist_progress(workflow, run_id).await?;

            if aborted || critical_failed {
                break;
            }
        }

        self.finalize(workflow, run_id, runbook, &gate, aborted, critical_failed)
            .await
    }

    /// Dispatch one tick's batch concurrently and resolve failures as the
    /// workers finish. Failure resolution blocks further dispatch but not
    /// the already-running workers.
    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        workflow: &str,
        run_id: i64,
        runbook: &Runbook,
        plan: &Plan,
        payloads: &[NodePayload],
        to_start: &[usize],
        gate: &mut [GateStatus],
        aborted: &mut bool,
        critical_failed: &mut bool,
    ) -> Result<(), EngineError> {
        let mut workers: JoinSet<Result<(usize, i64, Outcome), StoreError>> = JoinSet::new();

        for &idx in to_start {
            let node = &runbook.nodes[idx];
            let store = self.store.clone();
            let runner = self.runners.for_kind(&node.kind);
            let ctx = self.context_for(node);
            let payload = payloads[idx].clone();
            let workflow = workflow.to_string();

            workers.spawn(async move {
                let (attempt, outcome) =
                    attempt_once(&store, &workflow, run_id, runner, ctx, payload).await?;
                Ok((idx, attempt, outcome))
            });
        }

        while !workers.is_empty() {
            // After cancellation, give in-flight workers half the
            // interactive timeout to stop cooperatively; then force it.
            let joined = if self.cancel.is_cancelled() {
                match tokio::time::timeout(
                    Duration::from_secs(self.config.interactive_timeout_secs / 2),
                    workers.join_next(),
                )
                .await
                {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("workers did not stop in time; forcing shutdown");
                        workers.abort_all();
                        *aborted = true;
                        break;
                    }
                }
            } else {
                workers.join_next().await
            };

            let Some(joined) = joined else { break };
            let (idx, attempt, outcome) = joined
                .map_err(|e| EngineError::Internal(format!("worker failed: {e}")))??;

            let node = &runbook.nodes[idx];
            let end = if outcome.is_ok() {
                NodeEnd::Ok
            } else if *aborted || *critical_failed {
                // The run is already ending; record the NOK as final.
                NodeEnd::Nok { expected: true }
            } else {
                let runner = self.runners.for_kind(&node.kind);
                self.resolve_failure(
                    workflow,
                    run_id,
                    node,
                    idx,
                    plan,
                    runner,
                    &payloads[idx],
                    attempt,
                    outcome,
                )
                .await?
            };
            apply_end(idx, end, gate, aborted, critical_failed);
        }

        Ok(())
    }

    /// Serial path: one attempt, then the failure-resolution loop if needed.
    async fn run_node(
        &self,
        workflow: &str,
        run_id: i64,
        runbook: &Runbook,
        idx: usize,
        plan: &Plan,
        payload: &NodePayload,
    ) -> Result<NodeEnd, EngineError> {
        let node = &runbook.nodes[idx];
        let runner = self.runners.for_kind(&node.kind);
        let ctx = self.context_for(node);
        let (attempt, outcome) = attempt_once(
            &self.store,
            workflow,
            run_id,
            Arc::clone(&runner),
            ctx,
            payload.clone(),
        )
        .await?;

        if outcome.is_ok() {
            return Ok(NodeEnd::Ok);
        }
        self.resolve_failure(
            workflow, run_id, node, idx, plan, runner, payload, attempt, outcome,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Failure-resolution state machine
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn resolve_failure(
        &self,
        workflow: &str,
        run_id: i64,
        node: &NodeDescriptor,
        idx: usize,
        plan: &Plan,
        runner: Arc<dyn Runner>,
        payload: &NodePayload,
        mut attempt: i64,
        mut outcome: Outcome,
    ) -> Result<NodeEnd, EngineError> {
        // A failure somebody downstream consumes through `:failure` is a
        // branch, not a problem: accept NOK and move on.
        if plan.failure_consumed[idx] {
            debug!(node_id = %node.id, "failure consumed by a :failure edge");
            return Ok(NodeEnd::Nok { expected: true });
        }

        loop {
            if self.cancel.is_cancelled()
                || outcome.exception.as_deref() == Some("cancelled")
            {
                return Ok(NodeEnd::Cancelled);
            }

            // `max_retries` counts retries, so retry is offered while the
            // finished attempt number is still within the budget.
            let can_retry = attempt <= i64::from(self.config.max_retries);
            let can_skip = !node.critical;

            if !can_retry && !can_skip {
                warn!(node_id = %node.id, "critical node exhausted retries");
                return Ok(NodeEnd::Nok { expected: false });
            }

            let decision = if self.config.interactive {
                self.interactor
                    .on_failure(FailureContext {
                        node,
                        attempt,
                        max_retries: self.config.max_retries,
                        can_retry,
                        can_skip,
                        exception: outcome.exception.as_deref(),
                        stderr: outcome.stderr.as_deref(),
                        exit_code: outcome.exit_code,
                    })
                    .await
            } else if can_retry {
                FailureDecision::Retry
            } else {
                // Non-interactive and out of retries: forced skip.
                FailureDecision::Skip
            };

            match decision {
                FailureDecision::Retry if can_retry => {
                    info!(node_id = %node.id, attempt = attempt + 1, "retrying node");
                    let ctx = self.context_for(node);
                    let (next_attempt, next_outcome) = attempt_once(
                        &self.store,
                        workflow,
                        run_id,
                        Arc::clone(&runner),
                        ctx,
                        payload.clone(),
                    )
                    .await?;
                    attempt = next_attempt;
                    outcome = next_outcome;
                    if outcome.is_ok() {
                        return Ok(NodeEnd::Ok);
                    }
                }
                FailureDecision::Skip if can_skip => {
                    executions::append_terminal(
                        &self.store,
                        workflow,
                        run_id,
                        &node.id,
                        Utc::now(),
                        NodeStatus::Skipped,
                        OperatorDecision::Skip,
                        Some("skipped by operator"),
                    )
                    .await?;
                    info!(node_id = %node.id, "node skipped after failure");
                    return Ok(NodeEnd::Skipped);
                }
                FailureDecision::Abort => {
                    executions::append_terminal(
                        &self.store,
                        workflow,
                        run_id,
                        &node.id,
                        Utc::now(),
                        NodeStatus::Nok,
                        OperatorDecision::Abort,
                        Some("aborted by operator"),
                    )
                    .await?;
                    info!(node_id = %node.id, "run aborted by operator");
                    return Ok(NodeEnd::Aborted);
                }
                other => {
                    warn!(node_id = %node.id, ?other, "decision not available here; asking again");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize(
        &self,
        workflow: &str,
        run_id: i64,
        runbook: &Runbook,
        gate: &[GateStatus],
        aborted: bool,
        critical_failed: bool,
    ) -> Result<RunReport, EngineError> {
        let now = Utc::now();

        // Outcome rows are persisted before the run row transitions; any
        // attempt still open after cancellation is closed here first.
        if aborted {
            let closed =
                executions::close_open_attempts(&self.store, workflow, run_id, now, "cancelled")
                    .await?;
            if closed > 0 {
                debug!(closed, "closed in-flight attempts");
            }
        }

        let rows = executions::executions_for(&self.store, workflow, run_id).await?;
        let latest = latest_per_node(&rows);

        let mut counters = RunCounters::default();
        let mut any_critical_nok = false;
        for row in latest.values() {
            match row.node_status()? {
                NodeStatus::Ok => counters.ok += 1,
                NodeStatus::Nok => {
                    counters.nok += 1;
                    if runbook.node(&row.node_id).is_some_and(|n| n.critical) {
                        any_critical_nok = true;
                    }
                }
                NodeStatus::Skipped => counters.skipped += 1,
                NodeStatus::Pending => {}
            }
        }

        // Operator abort and cancellation win; otherwise a critical NOK
        // escalates the run; otherwise the run is OK.
        let status = if aborted {
            RunStatus::Aborted
        } else if critical_failed || any_critical_nok {
            RunStatus::Nok
        } else {
            RunStatus::Ok
        };

        let not_run: Vec<String> = runbook
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| matches!(gate[*i], GateStatus::Pending | GateStatus::Pruned))
            .map(|(_, n)| n.id.clone())
            .collect();

        runs::update_run_status(&self.store, workflow, run_id, status, counters, Some(now))
            .await?;
        info!(run_id, %status, ok = counters.ok, nok = counters.nok, skipped = counters.skipped, "run finished");

        Ok(RunReport {
            workflow_name: workflow.to_string(),
            run_id,
            status,
            counters,
            not_run,
        })
    }

    /// Refresh the run row's counters while the run is still live.
    async fn persist_progress(&self, workflow: &str, run_id: i64) -> Result<(), EngineError> {
        let rows = executions::executions_for(&self.store, workflow, run_id).await?;
        let latest = latest_per_node(&rows);

        let mut counters = RunCounters::default();
        for row in latest.values() {
            match row.node_status()? {
                NodeStatus::Ok => counters.ok += 1,
                NodeStatus::Nok => counters.nok += 1,
                NodeStatus::Skipped => counters.skipped += 1,
                NodeStatus::Pending => {}
            }
        }

        runs::update_run_status(
            &self.store,
            workflow,
            run_id,
            RunStatus::Running,
            counters,
            None,
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rendering and contexts
    // -----------------------------------------------------------------------

    fn eval_when(
        &self,
        when: &str,
        variables: &ResolvedVariables,
        plan: &Plan,
        gate: &[GateStatus],
    ) -> Result<bool, template::TemplateError> {
        let probe = RunProbe { plan, gate };
        let ctx = RenderContext::new(variables, &probe);
        let rendered = template::render_str(when, &ctx)?;
        Ok(!template::is_falsy_literal(&rendered))
    }

    /// Render every templated field of every node against the frozen
    /// variables. Status predicates render as false here; they are only
    /// meaningful inside `when` conditions, which render at dispatch time.
    fn render_payloads(
        &self,
        runbook: &Runbook,
        variables: &ResolvedVariables,
    ) -> Result<Vec<NodePayload>, EngineError> {
        let ctx = RenderContext::new(variables, &NullProbe);

        let render = |src: &str, field: String| -> Result<String, EngineError> {
            template::render_str(src, &ctx)
                .map_err(|source| EngineError::Template { field, source })
        };
        let render_opt = |src: &Option<String>, field: String| -> Result<Option<String>, EngineError> {
            src.as_deref().map(|s| render(s, field)).transpose()
        };

        let mut payloads = Vec::with_capacity(runbook.nodes.len());
        for node in &runbook.nodes {
            let payload = match &node.kind {
                NodeKind::Manual => NodePayload::Manual(ManualPayload {
                    node_id: node.id.clone(),
                    name: node.name.clone(),
                    description: render_opt(
                        &node.description,
                        format!("{}.description", node.id),
                    )?,
                    prompt_before: render_opt(
                        &node.prompt_before,
                        format!("{}.prompt_before", node.id),
                    )?,
                    prompt_after: render(
                        node.prompt_after
                            .as_deref()
                            .unwrap_or(crate::parse::DEFAULT_PROMPT_AFTER),
                        format!("{}.prompt_after", node.id),
                    )?,
                }),
                NodeKind::Command {
                    command,
                    interactive,
                } => NodePayload::Command(CommandPayload {
                    node_id: node.id.clone(),
                    command: render(command, format!("{}.command", node.id))?,
                    interactive: *interactive,
                }),
                NodeKind::Function {
                    plugin,
                    function,
                    params,
                    plugin_config,
                } => {
                    let mut rendered_params = std::collections::BTreeMap::new();
                    for (key, value) in params {
                        rendered_params.insert(
                            key.clone(),
                            render_json(value, &ctx, &format!("{}.params.{key}", node.id))?,
                        );
                    }

                    // Runbook-level plugin config first, node-level wins.
                    let mut config = runbook
                        .plugin_config
                        .get(plugin)
                        .cloned()
                        .unwrap_or_default();
                    for (key, value) in plugin_config {
                        config.insert(
                            key.clone(),
                            render_json(
                                value,
                                &ctx,
                                &format!("{}.plugin_config.{key}", node.id),
                            )?,
                        );
                    }

                    NodePayload::Function(FunctionPayload {
                        node_id: node.id.clone(),
                        plugin: plugin.clone(),
                        function: function.clone(),
                        params: rendered_params,
                        config,
                    })
                }
            };
            payloads.push(payload);
        }

        Ok(payloads)
    }

    fn context_for(&self, node: &NodeDescriptor) -> RunContext {
        let secs = match node.kind {
            NodeKind::Manual => node
                .timeout_secs
                .unwrap_or(self.config.interactive_timeout_secs),
            _ => node.timeout_secs.unwrap_or(self.config.default_timeout_secs),
        };
        RunContext {
            cancel: self.cancel.clone(),
            timeout: Duration::from_secs(secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// One attempt, bracketed by begin/finish rows. The begin row is committed
/// before the runner starts (long commands are visible as PENDING); the
/// finish row is committed before the engine looks at the outcome.
async fn attempt_once(
    store: &Store,
    workflow: &str,
    run_id: i64,
    runner: Arc<dyn Runner>,
    ctx: RunContext,
    payload: NodePayload,
) -> Result<(i64, Outcome), StoreError> {
    let node_id = payload.node_id().to_string();
    let started = Utc::now();
    let attempt = executions::begin_attempt(store, workflow, run_id, &node_id, started).await?;
    info!(node_id = %node_id, attempt, "attempt started");

    let outcome = runner.run(&ctx, &payload).await;
    let ended = Utc::now();

    let decision = outcome
        .operator_decision
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(OperatorDecision::None);

    let record = AttemptOutcome {
        status: if outcome.is_ok() {
            NodeStatus::Ok
        } else {
            NodeStatus::Nok
        },
        operator_decision: decision,
        result_text: outcome.result_text.clone(),
        exit_code: outcome.exit_code,
        exception: outcome.exception.clone(),
        stdout: outcome.stdout.clone(),
        stderr: outcome.stderr.clone(),
        duration_ms: Some((ended - started).num_milliseconds()),
    };
    executions::finish_attempt(store, workflow, run_id, &node_id, attempt, ended, &record)
        .await?;

    Ok((attempt, outcome))
}

fn render_json(
    value: &Value,
    ctx: &RenderContext<'_>,
    field: &str,
) -> Result<Value, EngineError> {
    Ok(match value {
        Value::String(s) => {
            let rendered = template::render_str(s, ctx).map_err(|source| {
                EngineError::Template {
                    field: field.to_string(),
                    source,
                }
            })?;
            Value::String(rendered)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_json(v, ctx, field))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_json(v, ctx, field)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn edge_satisfied(edge: &Edge, gate: &[GateStatus]) -> bool {
    let upstream = gate[edge.upstream];
    match edge.condition {
        EdgeCondition::Any => matches!(upstream, GateStatus::Ok | GateStatus::Skipped),
        EdgeCondition::Success => upstream == GateStatus::Ok,
        EdgeCondition::Failure => upstream == GateStatus::Nok,
    }
}

/// An edge is dead once its upstream is terminal in a state that can never
/// satisfy it.
fn edge_unsatisfiable(edge: &Edge, gate: &[GateStatus]) -> bool {
    let upstream = gate[edge.upstream];
    let terminal = !matches!(upstream, GateStatus::Pending);
    terminal && !edge_satisfied(edge, gate)
}

/// Mark every pending node with a dead incoming edge as PRUNED, to a fixed
/// point (pruning cascades).
fn propagate_prunes(plan: &Plan, gate: &mut [GateStatus]) {
    loop {
        let mut changed = false;
        for &i in &plan.order {
            if gate[i] != GateStatus::Pending {
                continue;
            }
            if plan.incoming[i].iter().any(|e| edge_unsatisfiable(e, gate)) {
                gate[i] = GateStatus::Pruned;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn ready_nodes(plan: &Plan, gate: &[GateStatus]) -> Vec<usize> {
    plan.order
        .iter()
        .copied()
        .filter(|&i| {
            gate[i] == GateStatus::Pending
                && plan.incoming[i].iter().all(|e| edge_satisfied(e, gate))
        })
        .collect()
}

fn apply_end(
    idx: usize,
    end: NodeEnd,
    gate: &mut [GateStatus],
    aborted: &mut bool,
    critical_failed: &mut bool,
) {
    match end {
        NodeEnd::Ok => gate[idx] = GateStatus::Ok,
        NodeEnd::Skipped => gate[idx] = GateStatus::Skipped,
        NodeEnd::Nok { expected } => {
            gate[idx] = GateStatus::Nok;
            if !expected {
                *critical_failed = true;
            }
        }
        NodeEnd::Aborted | NodeEnd::Cancelled => {
            gate[idx] = GateStatus::Nok;
            *aborted = true;
        }
    }
}

/// The max-attempt row per node is authoritative.
fn latest_per_node(rows: &[ExecutionRow]) -> std::collections::BTreeMap<&str, &ExecutionRow> {
    let mut latest: std::collections::BTreeMap<&str, &ExecutionRow> =
        std::collections::BTreeMap::new();
    for row in rows {
        match latest.get(row.node_id.as_str()) {
            Some(existing) if existing.attempt >= row.attempt => {}
            _ => {
                latest.insert(&row.node_id, row);
            }
        }
    }
    latest
}
