//! `ManualRunner` — operator-confirmed steps.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::traits::{NodePayload, Outcome, OutcomeStatus, RunContext, Runner};

/// The operator's answer to a confirmation prompt.
#[derive(Debug, Clone)]
pub struct ManualAnswer {
    pub approved: bool,
    /// Optional free-text note, recorded as the attempt's result text.
    pub note: Option<String>,
}

/// Port for asking the operator ok/nok questions. The CLI implements this
/// with real prompts; tests script it.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Show `prompt` for the given node and wait for an answer.
    async fn confirm(&self, node_id: &str, prompt: &str) -> ManualAnswer;

    /// Display a node description (no answer expected).
    async fn show_description(&self, node_id: &str, description: &str);
}

/// Runs Manual nodes: optional pre-confirmation, description display, then
/// the main confirmation. The whole interaction is bounded by the context
/// timeout; expiry yields NOK with `manual_timeout`.
pub struct ManualRunner {
    prompt: Arc<dyn OperatorPrompt>,
}

impl ManualRunner {
    pub fn new(prompt: Arc<dyn OperatorPrompt>) -> Self {
        Self { prompt }
    }

    async fn interact(&self, payload: &crate::traits::ManualPayload) -> Outcome {
        if let Some(before) = &payload.prompt_before {
            let answer = self.prompt.confirm(&payload.node_id, before).await;
            if !answer.approved {
                return Outcome {
                    status: OutcomeStatus::Nok,
                    operator_decision: Some("nok".to_string()),
                    result_text: answer.note,
                    ..Outcome::ok()
                };
            }
        }

        if let Some(description) = &payload.description {
            self.prompt
                .show_description(&payload.node_id, description)
                .await;
        }

        let answer = self
            .prompt
            .confirm(&payload.node_id, &payload.prompt_after)
            .await;
        debug!(node_id = %payload.node_id, approved = answer.approved, "manual answer");

        if answer.approved {
            Outcome {
                status: OutcomeStatus::Ok,
                operator_decision: Some("ok".to_string()),
                result_text: answer.note,
                ..Outcome::ok()
            }
        } else {
            Outcome {
                status: OutcomeStatus::Nok,
                operator_decision: Some("nok".to_string()),
                result_text: answer.note,
                ..Outcome::ok()
            }
        }
    }
}

#[async_trait]
impl Runner for ManualRunner {
    async fn run(&self, ctx: &RunContext, payload: &NodePayload) -> Outcome {
        let NodePayload::Manual(manual) = payload else {
            return Outcome::nok("manual runner received a non-manual node");
        };

        tokio::select! {
            outcome = self.interact(manual) => outcome,
            _ = tokio::time::sleep(ctx.timeout) => Outcome::nok("manual_timeout"),
            _ = ctx.cancel.cancelled() => Outcome::nok("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ManualPayload;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Scripted prompt: pops answers front-to-back, records prompts seen.
    struct ScriptedPrompt {
        answers: Mutex<Vec<ManualAnswer>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedPrompt {
        fn new(answers: Vec<ManualAnswer>) -> Self {
            Self {
                answers: Mutex::new(answers),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OperatorPrompt for ScriptedPrompt {
        async fn confirm(&self, _node_id: &str, prompt: &str) -> ManualAnswer {
            self.seen.lock().unwrap().push(prompt.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                ManualAnswer { approved: true, note: None }
            } else {
                answers.remove(0)
            }
        }

        async fn show_description(&self, _node_id: &str, _description: &str) {}
    }

    fn payload() -> NodePayload {
        NodePayload::Manual(ManualPayload {
            node_id: "check".into(),
            name: None,
            description: Some("verify the dashboard".into()),
            prompt_before: None,
            prompt_after: "All good?".into(),
        })
    }

    fn ctx() -> RunContext {
        RunContext {
            cancel: CancellationToken::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn approval_yields_ok() {
        let prompt = Arc::new(ScriptedPrompt::new(vec![ManualAnswer {
            approved: true,
            note: Some("looks healthy".into()),
        }]));
        let runner = ManualRunner::new(prompt.clone());

        let outcome = runner.run(&ctx(), &payload()).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.operator_decision.as_deref(), Some("ok"));
        assert_eq!(outcome.result_text.as_deref(), Some("looks healthy"));
        assert_eq!(prompt.seen.lock().unwrap().as_slice(), ["All good?"]);
    }

    #[tokio::test]
    async fn rejection_yields_nok() {
        let prompt = Arc::new(ScriptedPrompt::new(vec![ManualAnswer {
            approved: false,
            note: None,
        }]));
        let runner = ManualRunner::new(prompt);

        let outcome = runner.run(&ctx(), &payload()).await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.operator_decision.as_deref(), Some("nok"));
    }

    #[tokio::test]
    async fn prompt_before_rejection_short_circuits() {
        let prompt = Arc::new(ScriptedPrompt::new(vec![ManualAnswer {
            approved: false,
            note: None,
        }]));
        let runner = ManualRunner::new(prompt.clone());

        let p = NodePayload::Manual(ManualPayload {
            node_id: "gate".into(),
            name: None,
            description: None,
            prompt_before: Some("Proceed with maintenance?".into()),
            prompt_after: "Done?".into(),
        });
        let outcome = runner.run(&ctx(), &p).await;
        assert!(!outcome.is_ok());
        // The after-prompt was never shown.
        assert_eq!(
            prompt.seen.lock().unwrap().as_slice(),
            ["Proceed with maintenance?"]
        );
    }

    #[tokio::test]
    async fn timeout_yields_manual_timeout() {
        /// Prompt that never answers.
        struct SilentPrompt;
        #[async_trait]
        impl OperatorPrompt for SilentPrompt {
            async fn confirm(&self, _: &str, _: &str) -> ManualAnswer {
                std::future::pending().await
            }
            async fn show_description(&self, _: &str, _: &str) {}
        }

        let runner = ManualRunner::new(Arc::new(SilentPrompt));
        let ctx = RunContext {
            cancel: CancellationToken::new(),
            timeout: Duration::from_millis(20),
        };
        let outcome = runner.run(&ctx, &payload()).await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.exception.as_deref(), Some("manual_timeout"));
        assert!(outcome.operator_decision.is_none());
    }
}
