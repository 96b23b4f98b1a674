//! `FunctionRunner` — plugin function steps.

use std::sync::Arc;

use async_trait::async_trait;
use template::eval::value_to_string;
use tracing::debug;

use crate::plugin::{validate_params, PluginError, PluginRegistry};
use crate::traits::{NodePayload, Outcome, OutcomeStatus, RunContext, Runner};

/// Runs Function nodes: looks up the plugin, validates parameters against
/// the declared signature, then executes under the context's watchdog
/// timeout and cancellation token.
pub struct FunctionRunner {
    registry: Arc<PluginRegistry>,
}

impl FunctionRunner {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Runner for FunctionRunner {
    async fn run(&self, ctx: &RunContext, payload: &NodePayload) -> Outcome {
        let NodePayload::Function(function) = payload else {
            return Outcome::nok("function runner received a non-function node");
        };

        let Some(plugin) = self.registry.lookup(&function.plugin) else {
            return Outcome::nok(PluginError::NotFound(function.plugin.clone()).to_string());
        };

        let Some(sig) = plugin.metadata().functions.get(&function.function) else {
            return Outcome::nok(
                PluginError::FunctionNotFound {
                    plugin: function.plugin.clone(),
                    function: function.function.clone(),
                }
                .to_string(),
            );
        };

        let typed = match validate_params(sig, &function.params) {
            Ok(typed) => typed,
            Err(e) => return Outcome::nok(e.to_string()),
        };

        debug!(
            node_id = %function.node_id,
            plugin = %function.plugin,
            function = %function.function,
            "invoking plugin function"
        );

        tokio::select! {
            result = plugin.execute(&function.function, &typed, &function.config) => {
                match result {
                    Ok(value) => Outcome {
                        status: OutcomeStatus::Ok,
                        result_text: Some(value_to_string(&value)),
                        ..Outcome::ok()
                    },
                    Err(e) => Outcome::nok(e.to_string()),
                }
            }
            _ = tokio::time::sleep(ctx.timeout) => Outcome::nok("timeout"),
            _ = ctx.cancel.cancelled() => Outcome::nok("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinPlugin;
    use crate::traits::FunctionPayload;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn runner() -> FunctionRunner {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(BuiltinPlugin::new()));
        FunctionRunner::new(Arc::new(registry))
    }

    fn ctx(timeout: Duration) -> RunContext {
        RunContext {
            cancel: CancellationToken::new(),
            timeout,
        }
    }

    fn payload(plugin: &str, function: &str, params: BTreeMap<String, serde_json::Value>) -> NodePayload {
        NodePayload::Function(FunctionPayload {
            node_id: "fx".into(),
            plugin: plugin.into(),
            function: function.into(),
            params,
            config: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn successful_call_captures_result_text() {
        let params = BTreeMap::from([("message".to_string(), json!("done"))]);
        let outcome = runner()
            .run(&ctx(Duration::from_secs(5)), &payload("builtin", "echo", params))
            .await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.result_text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn plugin_failure_is_nok_with_exception() {
        let params = BTreeMap::from([("message".to_string(), json!("kaboom"))]);
        let outcome = runner()
            .run(&ctx(Duration::from_secs(5)), &payload("builtin", "fail", params))
            .await;
        assert!(!outcome.is_ok());
        assert!(outcome.exception.as_deref().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn unknown_plugin_is_nok() {
        let outcome = runner()
            .run(
                &ctx(Duration::from_secs(5)),
                &payload("nonexistent", "echo", BTreeMap::new()),
            )
            .await;
        assert!(!outcome.is_ok());
        assert!(outcome.exception.as_deref().unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn schema_mismatch_is_nok_before_execution() {
        let params = BTreeMap::from([("wrong_name".to_string(), json!(1))]);
        let outcome = runner()
            .run(&ctx(Duration::from_secs(5)), &payload("builtin", "echo", params))
            .await;
        assert!(!outcome.is_ok());
        assert!(outcome.exception.as_deref().unwrap().contains("invalid parameters"));
    }

    #[tokio::test]
    async fn watchdog_timeout_is_nok() {
        let params = BTreeMap::from([("duration_ms".to_string(), json!(60_000))]);
        let outcome = runner()
            .run(
                &ctx(Duration::from_millis(50)),
                &payload("builtin", "sleep_ms", params),
            )
            .await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.exception.as_deref(), Some("timeout"));
    }
}
