//! Core domain models for the runbook engine.
//!
//! These types are the in-memory source of truth for what a runbook looks
//! like. The parser builds them from the TOML surface; the planner and the
//! runtime only ever read them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use template::VarType;

/// Variables after merge, prompting and validation — frozen before the
/// engine starts.
pub type ResolvedVariables = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Runbook metadata
// ---------------------------------------------------------------------------

/// The required `[runbook]` header.
#[derive(Debug, Clone)]
pub struct RunbookMeta {
    pub title: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Kind-specific payload of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Operator-confirmed step.
    Manual,
    /// Shell command step.
    Command {
        command: String,
        /// tty passthrough: output goes to the terminal, capture is skipped.
        interactive: bool,
    },
    /// Plugin function step.
    Function {
        plugin: String,
        function: String,
        params: BTreeMap<String, Value>,
        /// Node-level plugin config, merged over the runbook-level table.
        plugin_config: BTreeMap<String, Value>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Manual => "Manual",
            Self::Command { .. } => "Command",
            Self::Function { .. } => "Function",
        }
    }
}

/// The raw dependency expression, as declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DependsOn {
    /// Omitted: previous node in declaration order (none for the first).
    #[default]
    Implicit,
    /// `"^"` — previous node in declaration order.
    Previous,
    /// `"*"` — every node declared before this one.
    AllPrevious,
    /// Explicit ids, each optionally suffixed `:success` / `:failure`.
    Explicit(Vec<String>),
}

/// A single step in the runbook graph.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    /// Unique within the runbook; the TOML table key.
    pub id: String,
    pub kind: NodeKind,
    pub depends_on: DependsOn,
    /// A critical node's final NOK escalates the whole run to NOK, and the
    /// node can never be skipped.
    pub critical: bool,
    /// Skip requested in the runbook itself.
    pub skip: bool,
    /// Per-node timeout; engine default applies when absent.
    pub timeout_secs: Option<u64>,
    /// Template gating execution; a falsy render skips the node.
    pub when: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Manual nodes only: confirmation before the step is shown.
    pub prompt_before: Option<String>,
    /// Manual nodes only: the closing ok/nok confirmation.
    pub prompt_after: Option<String>,
}

impl NodeDescriptor {
    /// Minimal descriptor of the given kind; used by tests and builders.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: DependsOn::Implicit,
            critical: false,
            skip: false,
            timeout_secs: None,
            when: None,
            name: None,
            description: None,
            prompt_before: None,
            prompt_after: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Declared shape of one runbook variable.
#[derive(Debug, Clone, Default)]
pub struct VariableSpec {
    pub default: Option<Value>,
    pub required: bool,
    pub choices: Option<Vec<Value>>,
    pub var_type: Option<VarType>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Runbook
// ---------------------------------------------------------------------------

/// A complete, immutable runbook. Node order is declaration order — the
/// implicit and `"*"` dependency forms depend on it.
#[derive(Debug, Clone)]
pub struct Runbook {
    pub meta: RunbookMeta,
    pub nodes: Vec<NodeDescriptor>,
    pub variables: BTreeMap<String, VariableSpec>,
    /// Per-plugin default configuration (`[runbook.plugin_config.<name>]`).
    pub plugin_config: BTreeMap<String, BTreeMap<String, Value>>,
    /// SHA-256 of the source file, hex-encoded.
    pub digest: String,
}

impl Runbook {
    /// Runs are keyed by the runbook title.
    pub fn workflow_name(&self) -> &str {
        &self.meta.title
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
