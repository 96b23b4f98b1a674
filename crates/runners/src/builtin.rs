//! The bundled `builtin` plugin: tiny utility functions used by demo
//! runbooks and the test suite.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use template::VarType;

use crate::plugin::{
    FunctionSignature, ParameterSpec, Plugin, PluginError, PluginMetadata,
};

pub struct BuiltinPlugin {
    metadata: PluginMetadata,
}

impl Default for BuiltinPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinPlugin {
    pub fn new() -> Self {
        let mut functions = BTreeMap::new();

        functions.insert(
            "echo".to_string(),
            FunctionSignature {
                name: "echo".into(),
                description: "Return the given message.".into(),
                parameters: BTreeMap::from([(
                    "message".to_string(),
                    ParameterSpec::of(VarType::String),
                )]),
            },
        );

        functions.insert(
            "sleep_ms".to_string(),
            FunctionSignature {
                name: "sleep_ms".into(),
                description: "Sleep for the given number of milliseconds.".into(),
                parameters: BTreeMap::from([("duration_ms".to_string(), {
                    let mut p = ParameterSpec::of(VarType::Int);
                    p.min = Some(0.0);
                    p
                })]),
            },
        );

        functions.insert(
            "fail".to_string(),
            FunctionSignature {
                name: "fail".into(),
                description: "Fail with the given message.".into(),
                parameters: BTreeMap::from([(
                    "message".to_string(),
                    ParameterSpec::optional(VarType::String, json!("requested failure")),
                )]),
            },
        );

        Self {
            metadata: PluginMetadata {
                name: "builtin".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                description: "Bundled utility functions.".into(),
                functions,
            },
        }
    }
}

#[async_trait]
impl Plugin for BuiltinPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        function: &str,
        params: &BTreeMap<String, Value>,
        _config: &BTreeMap<String, Value>,
    ) -> Result<Value, PluginError> {
        match function {
            "echo" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!(message))
            }
            "sleep_ms" => {
                let ms = params
                    .get("duration_ms")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
                Ok(json!(ms))
            }
            "fail" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure");
                Err(PluginError::Execution(message.to_string()))
            }
            other => Err(PluginError::FunctionNotFound {
                plugin: self.metadata.name.clone(),
                function: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_message() {
        let plugin = BuiltinPlugin::new();
        let params = BTreeMap::from([("message".to_string(), json!("hi"))]);
        let out = plugin.execute("echo", &params, &BTreeMap::new()).await.unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[tokio::test]
    async fn fail_returns_execution_error() {
        let plugin = BuiltinPlugin::new();
        let params = BTreeMap::from([("message".to_string(), json!("nope"))]);
        let err = plugin.execute("fail", &params, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::Execution(m) if m == "nope"));
    }

    #[tokio::test]
    async fn unknown_function_is_rejected() {
        let plugin = BuiltinPlugin::new();
        let err = plugin
            .execute("teleport", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::FunctionNotFound { .. }));
    }
}
