//! `CommandRunner` — shell command steps.

use std::sync::Arc;

use async_trait::async_trait;

use crate::process::ProcessRunner;
use crate::traits::{NodePayload, Outcome, OutcomeStatus, RunContext, Runner};

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Port for live display of command output while it is being captured.
pub trait CommandOutputSink: Send + Sync {
    fn line(&self, node_id: &str, stream: OutputStream, line: &str);
}

/// Sink that discards everything (non-interactive contexts, tests).
pub struct NullSink;

impl CommandOutputSink for NullSink {
    fn line(&self, _node_id: &str, _stream: OutputStream, _line: &str) {}
}

/// Runs Command nodes through the [`ProcessRunner`] port. Non-zero exit is
/// NOK with the exit code preserved; timeout and cancellation map to NOK
/// with `"timeout"` / `"cancelled"` exceptions.
pub struct CommandRunner {
    process: Arc<dyn ProcessRunner>,
    sink: Arc<dyn CommandOutputSink>,
}

impl CommandRunner {
    pub fn new(process: Arc<dyn ProcessRunner>, sink: Arc<dyn CommandOutputSink>) -> Self {
        Self { process, sink }
    }
}

#[async_trait]
impl Runner for CommandRunner {
    async fn run(&self, ctx: &RunContext, payload: &NodePayload) -> Outcome {
        let NodePayload::Command(command) = payload else {
            return Outcome::nok("command runner received a non-command node");
        };

        let result = self
            .process
            .run(
                &command.node_id,
                &command.command,
                ctx.timeout,
                command.interactive,
                &ctx.cancel,
                Arc::clone(&self.sink),
            )
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => return Outcome::nok(format!("failed to spawn command: {e}")),
        };

        let exception = if output.cancelled {
            Some("cancelled".to_string())
        } else if output.timed_out {
            Some("timeout".to_string())
        } else {
            None
        };

        let status = if output.exit_code == 0 && exception.is_none() {
            OutcomeStatus::Ok
        } else {
            OutcomeStatus::Nok
        };

        Outcome {
            status,
            operator_decision: None,
            result_text: None,
            exit_code: Some(output.exit_code),
            exception,
            stdout: non_empty(output.stdout),
            stderr: non_empty(output.stderr),
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
