//! The `Runner` trait — the contract every node handler must fulfil.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-attempt context handed to a runner.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Cooperative cancellation; set on SIGINT or engine shutdown.
    pub cancel: CancellationToken,
    /// Hard ceiling for this attempt.
    pub timeout: Duration,
}

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Ok,
    Nok,
}

/// What a runner produced. Failures are values, never `Err` — the engine
/// records them as NOK attempts and moves to the failure-resolution loop.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: OutcomeStatus,
    /// "ok" / "nok" for manual confirmations; engine-level decisions
    /// (retry/skip/abort) are written by the engine itself.
    pub operator_decision: Option<String>,
    pub result_text: Option<String>,
    pub exit_code: Option<i64>,
    pub exception: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Outcome {
    /// Successful outcome with no captured output.
    pub fn ok() -> Self {
        Self {
            status: OutcomeStatus::Ok,
            operator_decision: None,
            result_text: None,
            exit_code: None,
            exception: None,
            stdout: None,
            stderr: None,
        }
    }

    /// NOK outcome carrying only an exception string.
    pub fn nok(exception: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Nok,
            operator_decision: None,
            result_text: None,
            exit_code: None,
            exception: Some(exception.into()),
            stdout: None,
            stderr: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Rendered payloads
// ---------------------------------------------------------------------------
// The engine renders every templated field before dispatch; runners only see
// final strings and values.

#[derive(Debug, Clone)]
pub struct ManualPayload {
    pub node_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub prompt_before: Option<String>,
    pub prompt_after: String,
}

#[derive(Debug, Clone)]
pub struct CommandPayload {
    pub node_id: String,
    pub command: String,
    /// With a tty passthrough the command owns stdin/stdout; capture is
    /// degraded to nothing.
    pub interactive: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionPayload {
    pub node_id: String,
    pub plugin: String,
    pub function: String,
    pub params: BTreeMap<String, Value>,
    /// Global plugin config merged with the node-level override.
    pub config: BTreeMap<String, Value>,
}

/// A fully-rendered node, ready to execute.
#[derive(Debug, Clone)]
pub enum NodePayload {
    Manual(ManualPayload),
    Command(CommandPayload),
    Function(FunctionPayload),
}

impl NodePayload {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Manual(p) => &p.node_id,
            Self::Command(p) => &p.node_id,
            Self::Function(p) => &p.node_id,
        }
    }
}

/// The core runner trait. One implementation per node kind, plus the mock.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, ctx: &RunContext, payload: &NodePayload) -> Outcome;
}
