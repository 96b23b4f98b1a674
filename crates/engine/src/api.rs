//! The engine API surface consumed by the CLI: `run`, `resume`, `validate`,
//! `set_status`, `info`. Each call assembles a fresh engine around the
//! caller's ports; there is no global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use runners::{
    CommandOutputSink, CommandRunner, FunctionRunner, ManualRunner, OperatorPrompt,
    PluginRegistry, ShellProcessRunner,
};
use store::repository::runs;
use store::{RunRow, RunStatus, Store, StoreError};
use template::Template;

use crate::error::EngineError;
use crate::model::{NodeKind, Runbook, ResolvedVariables};
use crate::runtime::{Engine, EngineConfig, Interactor, RunReport, RunnerSet};
use crate::vars::{self, VarPrompter, VariableSources};
use crate::{parse, plan};

/// Caller-tunable options shared by `run` and `resume`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub state_path: PathBuf,
    pub max_retries: u32,
    pub default_timeout_secs: u64,
    pub interactive_timeout_secs: u64,
    pub parallel: bool,
    pub interactive: bool,
    /// Raw `KEY=VALUE` overrides.
    pub var_overrides: Vec<String>,
    pub vars_file: Option<PathBuf>,
    /// `None` disables environment scraping.
    pub vars_env_prefix: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            max_retries: 3,
            default_timeout_secs: 300,
            interactive_timeout_secs: 300,
            parallel: false,
            interactive: true,
            var_overrides: Vec::new(),
            vars_file: None,
            vars_env_prefix: Some(vars::DEFAULT_ENV_PREFIX.to_string()),
        }
    }
}

/// Default state database location: `$OPSBOOK_STATE_DIR/state.db`, falling
/// back to `~/.opsbook/state.db`.
pub fn default_state_path() -> PathBuf {
    let dir = std::env::var("OPSBOOK_STATE_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.opsbook")
    });
    PathBuf::from(dir).join("state.db")
}

/// The caller-provided port implementations.
pub struct EnginePorts {
    pub interactor: Arc<dyn Interactor>,
    pub operator_prompt: Arc<dyn OperatorPrompt>,
    pub output_sink: Arc<dyn CommandOutputSink>,
    pub var_prompter: Option<Arc<dyn VarPrompter>>,
    pub plugins: Arc<PluginRegistry>,
    pub cancel: CancellationToken,
}

/// Outcome of `validate`.
#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub workflow_name: String,
    pub node_count: usize,
    /// Node ids in execution order.
    pub order: Vec<String>,
}

/// Outcome of `set_status`.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub workflow_name: String,
    pub run_id: i64,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Outcome of `info`.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub workflow_name: String,
    /// Newest first.
    pub runs: Vec<RunRow>,
    /// Run ids still marked RUNNING — orphans unless an executor is alive.
    pub orphans: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Run a runbook from the start.
pub async fn run(
    file: &Path,
    options: &RunOptions,
    ports: &EnginePorts,
) -> Result<RunReport, EngineError> {
    let runbook = parse::load(file)?;
    let sources = variable_sources(options)?;
    let prompter = if options.interactive {
        ports.var_prompter.as_deref()
    } else {
        None
    };
    let variables = vars::resolve(&runbook.variables, &sources, prompter)?;

    let store = Store::open(&options.state_path).await?;
    warn_about_orphans(&store, runbook.workflow_name()).await?;

    let engine = build_engine(store, options, ports);
    engine.start(&runbook, variables).await
}

/// Resume an aborted run. `run_id = None` targets the latest run.
pub async fn resume(
    file: &Path,
    run_id: Option<i64>,
    options: &RunOptions,
    ports: &EnginePorts,
) -> Result<RunReport, EngineError> {
    let runbook = parse::load(file)?;

    // Only the caller-supplied layers overlay the persisted snapshot;
    // defaults were already baked in when the run started.
    let sources = variable_sources(options)?;
    let mut overlay: ResolvedVariables = BTreeMap::new();
    if let Some(prefix) = &sources.env_prefix {
        overlay.extend(vars::scrape_env(prefix));
    }
    if let Some(path) = &sources.file {
        overlay.extend(vars::load_file(path)?);
    }
    overlay.extend(sources.overrides);

    let store = Store::open(&options.state_path).await?;
    let engine = build_engine(store, options, ports);
    engine.resume(&runbook, run_id, overlay).await
}

/// Parse and plan a runbook without touching the store. Also checks the
/// syntax of every templated field.
pub fn validate(file: &Path) -> Result<ValidationSummary, EngineError> {
    let runbook = parse::load(file)?;
    let plan = plan::build(&runbook)?;
    check_template_syntax(&runbook)?;

    Ok(ValidationSummary {
        workflow_name: runbook.workflow_name().to_string(),
        node_count: runbook.nodes.len(),
        order: plan
            .order
            .iter()
            .map(|&i| runbook.nodes[i].id.clone())
            .collect(),
    })
}

/// Manually overwrite a run's status. The escape hatch for orphaned
/// RUNNING rows; the run row is otherwise only ever written by the engine.
pub async fn set_status(
    file: &Path,
    run_id: i64,
    new_status: RunStatus,
    state_path: &Path,
) -> Result<StatusChange, EngineError> {
    let runbook = parse::load(file)?;
    let workflow = runbook.workflow_name();

    let store = Store::open(state_path).await?;
    let run = runs::get_run(&store, workflow, run_id)
        .await?
        .ok_or(StoreError::RunNotFound {
            workflow_name: workflow.to_string(),
            run_id,
        })?;
    let from = run.run_status()?;

    runs::set_run_status(&store, workflow, run_id, new_status).await?;
    info!(workflow, run_id, %from, to = %new_status, "run status overridden");

    Ok(StatusChange {
        workflow_name: workflow.to_string(),
        run_id,
        from,
        to: new_status,
    })
}

/// Run history plus orphan detection for a workflow.
pub async fn info(file: &Path, state_path: &Path) -> Result<WorkflowInfo, EngineError> {
    let runbook = parse::load(file)?;
    let workflow = runbook.workflow_name();

    let store = Store::open(state_path).await?;
    let all_runs = runs::list_runs(&store, workflow).await?;
    let orphans = all_runs
        .iter()
        .filter(|r| r.end_time.is_none() && r.status == RunStatus::Running.to_string())
        .map(|r| r.run_id)
        .collect();

    Ok(WorkflowInfo {
        workflow_name: workflow.to_string(),
        runs: all_runs,
        orphans,
    })
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn build_engine(store: Store, options: &RunOptions, ports: &EnginePorts) -> Engine {
    let runners = RunnerSet {
        manual: Arc::new(ManualRunner::new(Arc::clone(&ports.operator_prompt))),
        command: Arc::new(CommandRunner::new(
            Arc::new(ShellProcessRunner),
            Arc::clone(&ports.output_sink),
        )),
        function: Arc::new(FunctionRunner::new(Arc::clone(&ports.plugins))),
    };

    let config = EngineConfig {
        max_retries: options.max_retries,
        default_timeout_secs: options.default_timeout_secs,
        interactive_timeout_secs: options.interactive_timeout_secs,
        parallel_execution: options.parallel,
        interactive: options.interactive,
    };

    Engine::new(store, runners, Arc::clone(&ports.interactor), config)
        .with_cancellation(ports.cancel.clone())
}

fn variable_sources(options: &RunOptions) -> Result<VariableSources, EngineError> {
    let mut overrides = BTreeMap::new();
    for raw in &options.var_overrides {
        let (key, value) = vars::parse_override(raw)?;
        overrides.insert(key, value);
    }
    Ok(VariableSources {
        overrides,
        file: options.vars_file.clone(),
        env_prefix: options.vars_env_prefix.clone(),
    })
}

/// Orphans are surfaced, never rewritten.
async fn warn_about_orphans(store: &Store, workflow: &str) -> Result<(), EngineError> {
    let orphans = runs::running_runs(store, workflow).await?;
    for run in orphans {
        tracing::warn!(
            run_id = run.run_id,
            "run is still marked RUNNING; if no executor is alive, repair it with set-status"
        );
    }
    Ok(())
}

fn check_template_syntax(runbook: &Runbook) -> Result<(), EngineError> {
    let check = |src: &str, field: String| -> Result<(), EngineError> {
        Template::parse(src)
            .map(|_| ())
            .map_err(|source| EngineError::Template { field, source })
    };

    for node in &runbook.nodes {
        if let Some(when) = &node.when {
            check(when, format!("{}.when", node.id))?;
        }
        match &node.kind {
            NodeKind::Command { command, .. } => {
                check(command, format!("{}.command", node.id))?;
            }
            NodeKind::Function { params, .. } => {
                for (key, value) in params {
                    if let Some(s) = value.as_str() {
                        check(s, format!("{}.params.{key}", node.id))?;
                    }
                }
            }
            NodeKind::Manual => {}
        }
        if let Some(description) = &node.description {
            check(description, format!("{}.description", node.id))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_runbook(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
        path
    }

    const VALID: &str = r#"
[runbook]
title = "demo"
description = "demo"
version = "1"
author = "ops"
created_at = "2024-05-01T09:00:00Z"

[first]
type = "Command"
command = "true"

[second]
type = "Command"
command = "false"
depends_on = "^"
"#;

    #[test]
    fn validate_reports_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_runbook(dir.path(), "demo.opsbook.toml", VALID);

        let summary = validate(&path).unwrap();
        assert_eq!(summary.workflow_name, "demo");
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.order, vec!["first", "second"]);
    }

    #[test]
    fn validate_rejects_cycles_with_exit_code_3() {
        let dir = tempfile::tempdir().unwrap();
        let cyclic = r#"
[runbook]
title = "demo"
description = "demo"
version = "1"
author = "ops"
created_at = "2024-05-01T09:00:00Z"

[a]
type = "Command"
command = "true"
depends_on = ["b"]

[b]
type = "Command"
command = "true"
depends_on = ["a"]
"#;
        let path = write_runbook(dir.path(), "cyclic.opsbook.toml", cyclic);
        let err = validate(&path).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn validate_rejects_bad_template_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let broken = r#"
[runbook]
title = "demo"
description = "demo"
version = "1"
author = "ops"
created_at = "2024-05-01T09:00:00Z"

[a]
type = "Command"
command = "echo {{ unclosed"
"#;
        let path = write_runbook(dir.path(), "broken.opsbook.toml", broken);
        let err = validate(&path).unwrap_err();
        assert!(matches!(err, EngineError::Template { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn set_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_runbook(dir.path(), "demo.opsbook.toml", VALID);
        let state = dir.path().join("state.db");

        let store = Store::open(&state).await.unwrap();
        let run_id = runs::create_run(
            &store,
            "demo",
            store::Trigger::Run,
            chrono::Utc::now(),
            "{}",
            "d",
        )
        .await
        .unwrap();
        drop(store);

        let change = set_status(&path, run_id, RunStatus::Aborted, &state)
            .await
            .unwrap();
        assert_eq!(change.from, RunStatus::Running);
        assert_eq!(change.to, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn info_lists_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_runbook(dir.path(), "demo.opsbook.toml", VALID);
        let state = dir.path().join("state.db");

        let store = Store::open(&state).await.unwrap();
        let orphan = runs::create_run(
            &store,
            "demo",
            store::Trigger::Run,
            chrono::Utc::now(),
            "{}",
            "d",
        )
        .await
        .unwrap();
        drop(store);

        let details = info(&path, &state).await.unwrap();
        assert_eq!(details.runs.len(), 1);
        assert_eq!(details.orphans, vec![orphan]);
    }
}
