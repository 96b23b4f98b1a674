//! Engine-level error taxonomy.
//!
//! Everything that can go wrong before a run starts (parse, plan, variable,
//! template errors) aborts without creating a run row. Runner failures are
//! never errors — they are NOK outcomes. Store errors mid-run are fatal.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// ParseError
// ---------------------------------------------------------------------------

/// Errors reading a runbook file into a [`crate::Runbook`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read runbook file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("runbook file must have a .opsbook.toml extension: {0}")]
    BadExtension(PathBuf),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("missing required [{0}] section")]
    MissingSection(&'static str),

    #[error("missing required field '{field}' in [runbook]")]
    MissingMeta { field: &'static str },

    #[error("missing required field '{field}' in node '{node}'")]
    MissingField { node: String, field: &'static str },

    #[error("node '{node}': field '{field}' {message}")]
    BadField {
        node: String,
        field: String,
        message: String,
    },

    #[error("unknown node type '{kind}' in node '{node}'")]
    UnknownKind { node: String, kind: String },

    #[error("created_at must be an RFC3339 timestamp: {0}")]
    BadTimestamp(String),
}

// ---------------------------------------------------------------------------
// PlanError
// ---------------------------------------------------------------------------

/// Errors produced by DAG expansion and validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("duplicate node id: '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownNode { node: String, dependency: String },

    /// The path closes on itself, e.g. `["a", "b", "a"]`.
    #[error("runbook contains a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("node '{0}' is critical and cannot request skip")]
    CriticalAndSkip(String),

    #[error("missing required field '{field}' in node '{node}'")]
    MissingField { node: String, field: &'static str },

    #[error("node '{node}': bad dependency qualifier in '{dependency}' (use :success or :failure)")]
    BadQualifier { node: String, dependency: String },
}

// ---------------------------------------------------------------------------
// VariableError
// ---------------------------------------------------------------------------

/// Errors resolving or validating variables.
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("required variable '{0}' is missing")]
    MissingRequired(String),

    #[error("variable '{name}' value {value} not in allowed choices")]
    BadChoice { name: String, value: String },

    #[error("variable '{name}': {source}")]
    CoercionFailed {
        name: String,
        #[source]
        source: template::CoerceError,
    },

    #[error("variable '{name}' value {value} is out of range")]
    OutOfRange { name: String, value: f64 },

    #[error("invalid variable format '{0}', expected KEY=VALUE")]
    BadOverride(String),

    #[error("cannot load variables file {path}: {message}")]
    BadFile { path: PathBuf, message: String },
}

// ---------------------------------------------------------------------------
// StateError
// ---------------------------------------------------------------------------

/// Run-state violations around resume.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("run already completed ok; nothing to resume")]
    NotResumableOk,

    #[error("run finished nok; start a new run instead of resuming")]
    NotResumableNok,

    #[error("run is still marked running; repair it with set-status before resuming")]
    NotResumableRunning,
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Umbrella error for the engine API surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error("template error in {field}: {source}")]
    Template {
        field: String,
        #[source]
        source: template::TemplateError,
    },

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot serialize state: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Process exit code for pre-run failures: 3 for anything that makes
    /// the runbook unrunnable, 4 for variable problems, 1 otherwise.
    /// (Run outcomes map separately: OK 0, NOK 1, ABORTED 2.)
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_) | Self::Plan(_) | Self::Template { .. } => 3,
            Self::Variable(_) => 4,
            _ => 1,
        }
    }

    /// A short operator-facing hint, when one exists.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Parse(ParseError::Io { .. }) => {
                Some("check the file path and ensure the file exists")
            }
            Self::Parse(_) => Some("check the TOML syntax and required fields"),
            Self::Plan(_) => Some("fix the dependency graph and run validate again"),
            Self::Variable(_) => {
                Some("check variable types and constraints in the runbook definition")
            }
            Self::State(StateError::NotResumableRunning) => {
                Some("if no executor is alive, run set-status <run> aborted first")
            }
            _ => None,
        }
    }
}
