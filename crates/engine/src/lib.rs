//! `engine` crate — core domain models, runbook parsing, DAG planning,
//! variable resolution, and the execution runtime.

pub mod api;
pub mod error;
pub mod model;
pub mod parse;
pub mod plan;
pub mod runtime;
pub mod vars;

pub use error::{EngineError, ParseError, PlanError, StateError, VariableError};
pub use model::{
    DependsOn, NodeDescriptor, NodeKind, ResolvedVariables, Runbook, RunbookMeta, VariableSpec,
};
pub use plan::{build as build_plan, EdgeCondition, Plan};
pub use runtime::{
    Engine, EngineConfig, FailureContext, FailureDecision, Interactor, RunReport, RunnerSet,
};
