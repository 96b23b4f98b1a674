//! Console implementations of the engine's operator-facing ports.

use async_trait::async_trait;
use dialoguer::{Confirm, Input, Select};

use engine::runtime::{FailureContext, FailureDecision, Interactor};
use engine::vars::VarPrompter;
use engine::VariableSpec;
use runners::{CommandOutputSink, ManualAnswer, OperatorPrompt, OutputStream};

// ---------------------------------------------------------------------------
// Failure prompts
// ---------------------------------------------------------------------------

/// Asks retry/skip/abort on the terminal.
pub struct ConsoleInteractor;

#[async_trait]
impl Interactor for ConsoleInteractor {
    async fn on_failure(&self, ctx: FailureContext<'_>) -> FailureDecision {
        eprintln!();
        eprintln!(
            "Node '{}' failed (attempt {}/{})",
            ctx.node.display_name(),
            ctx.attempt,
            ctx.max_retries + 1
        );
        if let Some(exception) = ctx.exception {
            eprintln!("  error: {exception}");
        }
        if let Some(code) = ctx.exit_code {
            eprintln!("  exit code: {code}");
        }
        if let Some(stderr) = ctx.stderr {
            if !stderr.trim().is_empty() {
                eprintln!("  stderr:\n{stderr}");
            }
        }

        let mut choices: Vec<(&str, FailureDecision)> = Vec::new();
        if ctx.can_retry {
            choices.push(("retry", FailureDecision::Retry));
        }
        if ctx.can_skip {
            choices.push(("skip", FailureDecision::Skip));
        }
        choices.push(("abort", FailureDecision::Abort));

        let labels: Vec<String> = choices.iter().map(|(label, _)| label.to_string()).collect();
        let picked = tokio::task::spawn_blocking(move || {
            Select::new()
                .with_prompt("How do you want to proceed?")
                .items(&labels)
                .default(0)
                .interact()
        })
        .await;

        match picked {
            Ok(Ok(index)) => choices[index].1,
            _ => FailureDecision::Abort,
        }
    }
}

// ---------------------------------------------------------------------------
// Manual-node prompts
// ---------------------------------------------------------------------------

/// Confirm prompts for Manual nodes.
pub struct ConsolePrompt;

#[async_trait]
impl OperatorPrompt for ConsolePrompt {
    async fn confirm(&self, _node_id: &str, prompt: &str) -> ManualAnswer {
        let prompt = prompt.to_string();
        let approved = tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(prompt)
                .default(true)
                .interact()
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false);

        ManualAnswer {
            approved,
            note: None,
        }
    }

    async fn show_description(&self, _node_id: &str, description: &str) {
        println!("\n{description}\n");
    }
}

/// Non-interactive stand-in: declines every manual confirmation so the
/// engine's forced-skip policy takes over.
pub struct DecliningPrompt;

#[async_trait]
impl OperatorPrompt for DecliningPrompt {
    async fn confirm(&self, _node_id: &str, _prompt: &str) -> ManualAnswer {
        ManualAnswer {
            approved: false,
            note: Some("interactive mode disabled".to_string()),
        }
    }

    async fn show_description(&self, _node_id: &str, _description: &str) {}
}

// ---------------------------------------------------------------------------
// Command output
// ---------------------------------------------------------------------------

/// Streams captured command output to the terminal as it arrives.
pub struct ConsoleSink;

impl CommandOutputSink for ConsoleSink {
    fn line(&self, node_id: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => println!("[{node_id}] {line}"),
            OutputStream::Stderr => eprintln!("[{node_id}] {line}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Variable prompts
// ---------------------------------------------------------------------------

/// Prompts for missing required variables.
pub struct ConsoleVarPrompter;

impl VarPrompter for ConsoleVarPrompter {
    fn prompt(&self, name: &str, spec: &VariableSpec) -> Option<String> {
        let mut message = format!("Enter value for {name}");
        if let Some(description) = &spec.description {
            message.push_str(&format!(" ({description})"));
        }
        if let Some(choices) = &spec.choices {
            let rendered: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
            message.push_str(&format!(" [choices: {}]", rendered.join(", ")));
        }

        Input::<String>::new()
            .with_prompt(message)
            .interact_text()
            .ok()
    }
}
