//! Typed coercion of rendered values.
//!
//! Rendering always yields strings; when a variable spec or a plugin
//! parameter declares a type, the string is coerced afterwards using the
//! rules below. Values that already carry the declared type pass through
//! unchanged.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::CoerceError;

/// Declared value types for variables and plugin parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    String,
    Int,
    Float,
    Bool,
    List,
    Dict,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
        };
        write!(f, "{s}")
    }
}

impl FromStr for VarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" | "str" => Ok(Self::String),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" => Ok(Self::Bool),
            "list" => Ok(Self::List),
            "dict" => Ok(Self::Dict),
            other => Err(format!("unknown type: {other}")),
        }
    }
}

/// `true` when `s` is one of the literals treated as false by `when` gates:
/// `"false"`, `"0"`, `"no"`, `""` (case-insensitive, surrounding whitespace
/// ignored).
pub fn is_falsy_literal(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "")
}

/// Coerce `value` to the declared `ty`.
///
/// String inputs are converted ("true"/"1"/"yes"/"on" → bool, decimal digits
/// → int, fractional → float, JSON text → list/dict); values already of the
/// declared type are passed through. Anything else is a [`CoerceError`].
pub fn coerce(value: &Value, ty: VarType) -> Result<Value, CoerceError> {
    let err = || CoerceError {
        value: value.to_string(),
        ty,
    };

    // Pass-through for values that already match.
    match (ty, value) {
        (VarType::String, Value::String(_)) => return Ok(value.clone()),
        (VarType::Bool, Value::Bool(_)) => return Ok(value.clone()),
        (VarType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => {
            return Ok(value.clone());
        }
        (VarType::Float, Value::Number(_)) => return Ok(value.clone()),
        (VarType::List, Value::Array(_)) => return Ok(value.clone()),
        (VarType::Dict, Value::Object(_)) => return Ok(value.clone()),
        _ => {}
    }

    // Non-string cross-type conversions.
    if let Value::Number(n) = value {
        if ty == VarType::Int {
            // 3.0 is acceptable as int; 3.5 is not.
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    return Ok(Value::from(f as i64));
                }
            }
            return Err(err());
        }
    }

    let Value::String(s) = value else {
        return Err(err());
    };
    let trimmed = s.trim();

    match ty {
        VarType::String => Ok(value.clone()),
        VarType::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(err()),
        },
        VarType::Int => trimmed
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| err()),
        VarType::Float => trimmed
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| err()),
        VarType::List => match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Ok(Value::Array(items)),
            _ => Err(err()),
        },
        VarType::Dict => match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            _ => Err(err()),
        },
    }
}
