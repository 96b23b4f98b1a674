//! `opsbook` CLI entry-point.
//!
//! Sub-commands:
//! - `run`        — run a runbook from start to finish.
//! - `resume`     — resume an aborted run.
//! - `validate`   — parse and plan a runbook without executing it.
//! - `set-status` — manually override a run's status (orphan repair).
//! - `info`       — run history and orphan detection for a workflow.
//!
//! Exit codes: 0 run OK, 1 run NOK, 2 run ABORTED, 3 validation/plan
//! error, 4 variable error.

mod interact;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use engine::api::{self, EnginePorts, RunOptions};
use engine::runtime::Interactor;
use engine::EngineError;
use runners::{builtin::BuiltinPlugin, NullSink, OperatorPrompt, PluginRegistry};
use store::RunStatus;

use interact::{
    ConsoleInteractor, ConsolePrompt, ConsoleSink, ConsoleVarPrompter, DecliningPrompt,
};

#[derive(Parser)]
#[command(name = "opsbook", about = "Local-first runbook executor", version)]
struct Cli {
    /// State database path (default: ~/.opsbook/state.db).
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct ExecArgs {
    /// Runbook file path (*.opsbook.toml).
    file: PathBuf,

    /// Set a variable in KEY=VALUE form (repeatable).
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// Load variables from a file (toml / json / yaml / env).
    #[arg(long)]
    vars_file: Option<PathBuf>,

    /// Environment variable prefix for loading variables.
    #[arg(long, default_value = engine::vars::DEFAULT_ENV_PREFIX)]
    vars_env: String,

    /// Maximum retry attempts per failed node.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Default per-node timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Execute independent nodes concurrently.
    #[arg(long)]
    parallel: bool,

    /// Never prompt: auto-retry, then skip non-critical failures.
    #[arg(long)]
    non_interactive: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a runbook from start to finish.
    Run {
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Resume a previously aborted run.
    Resume {
        #[command(flatten)]
        exec: ExecArgs,
        /// Run id to resume; defaults to the latest run.
        #[arg(long)]
        run_id: Option<i64>,
    },
    /// Validate a runbook without executing it.
    Validate {
        /// Runbook file path.
        file: PathBuf,
    },
    /// Manually set a run's status (repairs orphaned RUNNING rows).
    SetStatus {
        /// Runbook file path.
        file: PathBuf,
        /// Run id to update.
        run_id: i64,
        /// New status: running, ok, nok or aborted.
        status: String,
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        force: bool,
    },
    /// Show run history and orphans for a workflow.
    Info {
        /// Runbook file path.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = dispatch(cli).await;
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> i32 {
    let state_path = cli
        .state_path
        .clone()
        .unwrap_or_else(api::default_state_path);

    match cli.command {
        Command::Run { exec } => {
            let (options, ports) = assemble(&exec, state_path);
            report_outcome(api::run(&exec.file, &options, &ports).await)
        }
        Command::Resume { exec, run_id } => {
            let (options, ports) = assemble(&exec, state_path);
            report_outcome(api::resume(&exec.file, run_id, &options, &ports).await)
        }
        Command::Validate { file } => match api::validate(&file) {
            Ok(summary) => {
                println!(
                    "Runbook '{}' is valid ({} nodes).",
                    summary.workflow_name, summary.node_count
                );
                println!("Execution order: {}", summary.order.join(", "));
                0
            }
            Err(e) => report_error(e),
        },
        Command::SetStatus {
            file,
            run_id,
            status,
            force,
        } => set_status(&file, run_id, &status, force, &state_path).await,
        Command::Info { file } => match api::info(&file, &state_path).await {
            Ok(details) => {
                println!("Workflow: {}", details.workflow_name);
                if details.runs.is_empty() {
                    println!("No runs recorded yet.");
                }
                for run in &details.runs {
                    println!(
                        "  #{:<4} {:8} started {}  ok={} nok={} skipped={}",
                        run.run_id,
                        run.status,
                        run.start_time.to_rfc3339(),
                        run.nodes_ok,
                        run.nodes_nok,
                        run.nodes_skipped,
                    );
                }
                if !details.orphans.is_empty() {
                    println!();
                    for run_id in &details.orphans {
                        println!(
                            "Run #{run_id} is still marked RUNNING. If no executor is alive, \
                             repair it with: opsbook set-status <file> {run_id} aborted"
                        );
                    }
                }
                0
            }
            Err(e) => report_error(e),
        },
    }
}

/// Build options and ports for run/resume, including SIGINT wiring.
fn assemble(exec: &ExecArgs, state_path: PathBuf) -> (RunOptions, EnginePorts) {
    let options = RunOptions {
        state_path,
        max_retries: exec.max_retries,
        default_timeout_secs: exec.timeout,
        interactive_timeout_secs: 300,
        parallel: exec.parallel,
        interactive: !exec.non_interactive,
        var_overrides: exec.vars.clone(),
        vars_file: exec.vars_file.clone(),
        vars_env_prefix: Some(exec.vars_env.clone()),
    };

    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(BuiltinPlugin::new()));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupt received; stopping after in-flight nodes...");
                cancel.cancel();
            }
        });
    }

    let interactor: Arc<dyn Interactor> = Arc::new(ConsoleInteractor);
    let operator_prompt: Arc<dyn OperatorPrompt> = if exec.non_interactive {
        Arc::new(DecliningPrompt)
    } else {
        Arc::new(ConsolePrompt)
    };

    let ports = EnginePorts {
        interactor,
        operator_prompt,
        output_sink: if exec.non_interactive {
            Arc::new(NullSink)
        } else {
            Arc::new(ConsoleSink)
        },
        var_prompter: Some(Arc::new(ConsoleVarPrompter)),
        plugins: Arc::new(plugins),
        cancel,
    };

    (options, ports)
}

fn report_outcome(result: Result<engine::RunReport, EngineError>) -> i32 {
    match result {
        Ok(report) => {
            println!();
            match report.status {
                RunStatus::Ok => println!("Run #{} completed successfully.", report.run_id),
                RunStatus::Nok => println!("Run #{} failed.", report.run_id),
                RunStatus::Aborted => println!("Run #{} aborted.", report.run_id),
                RunStatus::Running => println!("Run #{} still running.", report.run_id),
            }
            println!(
                "  ok={} nok={} skipped={}",
                report.counters.ok, report.counters.nok, report.counters.skipped
            );
            if !report.not_run.is_empty() {
                println!("  not run: {}", report.not_run.join(", "));
            }
            report.exit_code()
        }
        Err(e) => report_error(e),
    }
}

fn report_error(e: EngineError) -> i32 {
    eprintln!("Error: {e}");
    if let Some(suggestion) = e.suggestion() {
        eprintln!("Hint: {suggestion}");
    }
    e.exit_code()
}

async fn set_status(
    file: &std::path::Path,
    run_id: i64,
    status: &str,
    force: bool,
    state_path: &std::path::Path,
) -> i32 {
    let new_status: RunStatus = match status.to_ascii_lowercase().parse() {
        Ok(status) => status,
        Err(_) => {
            eprintln!("Invalid status '{status}'. Valid: running, ok, nok, aborted.");
            return 3;
        }
    };

    if new_status == RunStatus::Running && !force {
        eprintln!(
            "Warning: setting a run back to RUNNING may interfere with a live executor."
        );
    }

    if !force {
        let prompt = format!("Set run #{run_id} to {new_status}?");
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirmed {
            println!("Cancelled.");
            return 0;
        }
    }

    match api::set_status(file, run_id, new_status, state_path).await {
        Ok(change) => {
            info!(run_id, from = %change.from, to = %change.to, "status updated");
            println!(
                "Run #{} status: {} -> {}",
                change.run_id, change.from, change.to
            );
            if change.to == RunStatus::Aborted {
                println!("You can now resume it with: opsbook resume {} --run-id {}", file.display(), run_id);
            }
            0
        }
        Err(e) => report_error(e),
    }
}
