//! Template-level error types.

use thiserror::Error;

use crate::coerce::VarType;

/// Errors produced while parsing or rendering a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template or an embedded expression is malformed.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// A referenced variable is not defined in the render context.
    #[error("undefined variable '{0}'")]
    Undefined(String),

    /// A filter name is not part of the supported set.
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    /// A function name is not part of the supported set.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// An operation was applied to values of incompatible types.
    #[error("type error: {0}")]
    Type(String),
}

impl TemplateError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            offset,
            message: message.into(),
        }
    }
}

/// Failure to coerce a rendered value to a declared type.
#[derive(Debug, Error)]
#[error("cannot coerce {value} to {ty}")]
pub struct CoerceError {
    /// Display form of the offending value.
    pub value: String,
    /// The declared target type.
    pub ty: VarType,
}
