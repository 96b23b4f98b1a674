//! `runners` crate — the `Runner` contract and the three node handlers.
//!
//! Every node kind — Manual, Command, Function — is executed through the
//! [`Runner`] trait. Runners never fail with `Err`: any failure is expressed
//! as an [`Outcome`] with NOK status, so the engine's dispatch loop only has
//! to deal with store errors.

pub mod builtin;
pub mod command;
pub mod function;
pub mod manual;
pub mod mock;
pub mod plugin;
pub mod process;
pub mod traits;

pub use command::{CommandOutputSink, CommandRunner, NullSink, OutputStream};
pub use function::FunctionRunner;
pub use manual::{ManualAnswer, ManualRunner, OperatorPrompt};
pub use mock::MockRunner;
pub use plugin::{
    FunctionSignature, ParameterSpec, Plugin, PluginError, PluginMetadata, PluginRegistry,
};
pub use process::{ProcessOutput, ProcessRunner, ShellProcessRunner};
pub use traits::{
    CommandPayload, FunctionPayload, ManualPayload, NodePayload, Outcome, OutcomeStatus,
    RunContext, Runner,
};
