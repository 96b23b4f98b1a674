//! `MockRunner` — a scripted test double for `Runner`.
//!
//! Engine tests script per-node outcome sequences: the first call for a node
//! pops the first outcome, the second call the second, and so on. Nodes with
//! no script (or an exhausted script) succeed.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::traits::{NodePayload, Outcome, RunContext, Runner};

pub struct MockRunner {
    scripts: Mutex<HashMap<String, Vec<Outcome>>>,
    calls: Mutex<Vec<String>>,
    payloads: Mutex<Vec<NodePayload>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            payloads: Mutex::new(Vec::new()),
        }
    }

    /// Script the outcomes for `node_id`, consumed one per call.
    pub fn script(&self, node_id: impl Into<String>, outcomes: Vec<Outcome>) {
        self.scripts.lock().unwrap().insert(node_id.into(), outcomes);
    }

    /// Node ids in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Every payload seen, in call order.
    pub fn payloads(&self) -> Vec<NodePayload> {
        self.payloads.lock().unwrap().clone()
    }

    /// Number of times `node_id` was executed.
    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == node_id)
            .count()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn run(&self, _ctx: &RunContext, payload: &NodePayload) -> Outcome {
        let node_id = payload.node_id().to_string();
        self.calls.lock().unwrap().push(node_id.clone());
        self.payloads.lock().unwrap().push(payload.clone());

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&node_id) {
            Some(outcomes) if !outcomes.is_empty() => outcomes.remove(0),
            _ => Outcome::ok(),
        }
    }
}
