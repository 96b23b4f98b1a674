//! The plugin contract for Function nodes.
//!
//! The registry is a closed enumeration: plugins are registered explicitly
//! at startup, never discovered or loaded from arbitrary code. Each plugin
//! declares the signatures of its functions; parameters are validated and
//! coerced against the declared schema before `execute` runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use template::{coerce, VarType};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

/// Declared shape of one function parameter.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub param_type: VarType,
    pub required: bool,
    pub default: Option<Value>,
    pub choices: Option<Vec<Value>>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Required parameter of the given type, no constraints.
    pub fn of(param_type: VarType) -> Self {
        Self {
            param_type,
            required: true,
            default: None,
            choices: None,
            min: None,
            max: None,
            description: None,
        }
    }

    pub fn optional(param_type: VarType, default: Value) -> Self {
        Self {
            required: false,
            default: Some(default),
            ..Self::of(param_type)
        }
    }
}

/// Signature of a callable plugin function.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
}

/// Metadata a plugin publishes at registration time.
#[derive(Debug, Clone)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub functions: BTreeMap<String, FunctionSignature>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' is not registered")]
    NotFound(String),

    #[error("plugin '{plugin}' has no function '{function}'")]
    FunctionNotFound { plugin: String, function: String },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("plugin execution failed: {0}")]
    Execution(String),
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A registered provider of named functions.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    /// Execute `function` with already-validated, typed parameters.
    async fn execute(
        &self,
        function: &str,
        params: &BTreeMap<String, Value>,
        config: &BTreeMap<String, Value>,
    ) -> Result<Value, PluginError>;
}

/// Closed plugin registry keyed by plugin name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its metadata name. Re-registration replaces.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.metadata().name.clone();
        self.plugins.insert(name, plugin);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Parameter validation
// ---------------------------------------------------------------------------

/// Validate `params` against `sig`: reject unknown names, fill defaults,
/// coerce each value to its declared type, then enforce choices and numeric
/// ranges. Returns the typed parameter map passed to `Plugin::execute`.
pub fn validate_params(
    sig: &FunctionSignature,
    params: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, PluginError> {
    for name in params.keys() {
        if !sig.parameters.contains_key(name) {
            return Err(PluginError::InvalidParams(format!(
                "unknown parameter '{name}' for function '{}'",
                sig.name
            )));
        }
    }

    let mut typed = BTreeMap::new();
    for (name, spec) in &sig.parameters {
        let raw = match params.get(name) {
            Some(value) => value.clone(),
            None => match (&spec.default, spec.required) {
                (Some(default), _) => default.clone(),
                (None, false) => continue,
                (None, true) => {
                    return Err(PluginError::InvalidParams(format!(
                        "required parameter '{name}' missing for function '{}'",
                        sig.name
                    )))
                }
            },
        };

        let value = coerce(&raw, spec.param_type)
            .map_err(|e| PluginError::InvalidParams(format!("parameter '{name}': {e}")))?;

        if let Some(choices) = &spec.choices {
            if !choices.contains(&value) {
                return Err(PluginError::InvalidParams(format!(
                    "parameter '{name}' value {value} not in allowed choices"
                )));
            }
        }

        if let Some(n) = value.as_f64() {
            if spec.min.is_some_and(|min| n < min) {
                return Err(PluginError::InvalidParams(format!(
                    "parameter '{name}' value {n} is below minimum"
                )));
            }
            if spec.max.is_some_and(|max| n > max) {
                return Err(PluginError::InvalidParams(format!(
                    "parameter '{name}' value {n} is above maximum"
                )));
            }
        }

        typed.insert(name.clone(), value);
    }

    Ok(typed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sig() -> FunctionSignature {
        let mut parameters = BTreeMap::new();
        parameters.insert("count".to_string(), {
            let mut p = ParameterSpec::of(VarType::Int);
            p.min = Some(1.0);
            p.max = Some(10.0);
            p
        });
        parameters.insert(
            "mode".to_string(),
            ParameterSpec {
                choices: Some(vec![json!("fast"), json!("safe")]),
                ..ParameterSpec::optional(VarType::String, json!("safe"))
            },
        );
        FunctionSignature {
            name: "demo".into(),
            description: "demo function".into(),
            parameters,
        }
    }

    #[test]
    fn coerces_rendered_strings() {
        let mut params = BTreeMap::new();
        params.insert("count".to_string(), json!("5"));
        let typed = validate_params(&sig(), &params).unwrap();
        assert_eq!(typed["count"], json!(5));
        // Default filled in.
        assert_eq!(typed["mode"], json!("safe"));
    }

    #[test]
    fn rejects_unknown_parameter() {
        let mut params = BTreeMap::new();
        params.insert("count".to_string(), json!(1));
        params.insert("bogus".to_string(), json!(true));
        assert!(matches!(
            validate_params(&sig(), &params),
            Err(PluginError::InvalidParams(_))
        ));
    }

    #[test]
    fn rejects_missing_required() {
        let params = BTreeMap::new();
        assert!(matches!(
            validate_params(&sig(), &params),
            Err(PluginError::InvalidParams(_))
        ));
    }

    #[test]
    fn enforces_range_and_choices() {
        let mut params = BTreeMap::new();
        params.insert("count".to_string(), json!(99));
        assert!(validate_params(&sig(), &params).is_err());

        let mut params = BTreeMap::new();
        params.insert("count".to_string(), json!(2));
        params.insert("mode".to_string(), json!("reckless"));
        assert!(validate_params(&sig(), &params).is_err());
    }
}
