//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour beyond
//! typed accessors for their status columns. Domain types live in the
//! `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Ok,
    Nok,
    Aborted,
}

impl RunStatus {
    /// `true` for the states a run can never leave.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Ok => write!(f, "ok"),
            Self::Nok => write!(f, "nok"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "ok"      => Ok(Self::Ok),
            "nok"     => Ok(Self::Nok),
            "aborted" => Ok(Self::Aborted),
            other     => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Status of a single node attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Ok,
    Nok,
    Skipped,
    #[default]
    Pending,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Nok => write!(f, "nok"),
            Self::Skipped => write!(f, "skipped"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok"      => Ok(Self::Ok),
            "nok"     => Ok(Self::Nok),
            "skipped" => Ok(Self::Skipped),
            "pending" => Ok(Self::Pending),
            other     => Err(format!("unknown node status: {other}")),
        }
    }
}

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Run,
    Resume,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run"    => Ok(Self::Run),
            "resume" => Ok(Self::Resume),
            other    => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// The operator's decision attached to an attempt record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorDecision {
    Ok,
    Nok,
    Retry,
    Skip,
    Abort,
    #[default]
    None,
}

impl std::fmt::Display for OperatorDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Nok => write!(f, "nok"),
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Abort => write!(f, "abort"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for OperatorDecision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok"    => Ok(Self::Ok),
            "nok"   => Ok(Self::Nok),
            "retry" => Ok(Self::Retry),
            "skip"  => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            "none"  => Ok(Self::None),
            other   => Err(format!("unknown operator decision: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// Node counters carried on the run row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub ok: i64,
    pub nok: i64,
    pub skipped: i64,
}

/// A persisted run row. PK is `(workflow_name, run_id)`; `run_id`
/// autoincrements per workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub workflow_name: String,
    pub run_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub trigger: String,
    pub nodes_ok: i64,
    pub nodes_nok: i64,
    pub nodes_skipped: i64,
    /// JSON snapshot of the resolved variables the run was started with.
    pub variables_json: String,
    /// SHA-256 of the runbook file, for consistency checks on resume.
    pub runbook_digest: String,
}

impl RunRow {
    pub fn run_status(&self) -> Result<RunStatus, StoreError> {
        self.status
            .parse()
            .map_err(StoreError::Decode)
    }

    pub fn run_trigger(&self) -> Result<Trigger, StoreError> {
        self.trigger
            .parse()
            .map_err(StoreError::Decode)
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            ok: self.nodes_ok,
            nok: self.nodes_nok,
            skipped: self.nodes_skipped,
        }
    }
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// A persisted node attempt row. PK is
/// `(workflow_name, run_id, node_id, attempt)`; attempts are dense 1..N per
/// node and the max-attempt row is authoritative for the node's status.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub workflow_name: String,
    pub run_id: i64,
    pub node_id: String,
    pub attempt: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub operator_decision: String,
    pub result_text: Option<String>,
    pub exit_code: Option<i64>,
    pub exception: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i64>,
}

impl ExecutionRow {
    pub fn node_status(&self) -> Result<NodeStatus, StoreError> {
        self.status
            .parse()
            .map_err(StoreError::Decode)
    }

    pub fn decision(&self) -> Result<OperatorDecision, StoreError> {
        self.operator_decision
            .parse()
            .map_err(StoreError::Decode)
    }
}
