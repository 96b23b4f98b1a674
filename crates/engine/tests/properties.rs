//! Property tests over the engine's persistence and precedence invariants.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use engine::{
    DependsOn, Engine, EngineConfig, FailureContext, FailureDecision, Interactor,
    NodeDescriptor, NodeKind, Runbook, RunbookMeta, RunnerSet, VariableSpec,
};
use engine::vars::{self, VariableSources};
use runners::{MockRunner, Outcome, Runner};
use store::repository::executions;
use store::{NodeStatus, RunStatus, Store};

struct NeverAsked;

#[async_trait]
impl Interactor for NeverAsked {
    async fn on_failure(&self, _ctx: FailureContext<'_>) -> FailureDecision {
        FailureDecision::Abort
    }
}

fn command_node(id: &str) -> NodeDescriptor {
    NodeDescriptor::new(
        id,
        NodeKind::Command {
            command: format!("run-{id}"),
            interactive: false,
        },
    )
}

fn runbook(nodes: Vec<NodeDescriptor>) -> Runbook {
    Runbook {
        meta: RunbookMeta {
            title: "prop".into(),
            description: "property tests".into(),
            version: "0".into(),
            author: "tests".into(),
            created_at: chrono::Utc::now(),
        },
        nodes,
        variables: BTreeMap::new(),
        plugin_config: BTreeMap::new(),
        digest: "prop".into(),
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Attempt numbers per (run, node) are exactly 1..N, whatever the mix
    /// of failures and retries.
    #[test]
    fn attempt_numbers_are_dense(failures_per_node in proptest::collection::vec(0usize..4, 1..5)) {
        runtime().block_on(async {
            let store = Store::in_memory().await.unwrap();
            let mock = Arc::new(MockRunner::new());

            let mut nodes = Vec::new();
            for (i, &failures) in failures_per_node.iter().enumerate() {
                let id = format!("n{i}");
                let mut script: Vec<Outcome> =
                    (0..failures).map(|k| Outcome::nok(format!("fail {k}"))).collect();
                script.push(Outcome::ok());
                mock.script(id.clone(), script);
                nodes.push(command_node(&id));
            }

            let runner: Arc<dyn Runner> = mock.clone();
            let engine = Engine::new(
                store.clone(),
                RunnerSet::uniform(runner),
                Arc::new(NeverAsked),
                EngineConfig {
                    max_retries: 4,
                    interactive: false,
                    ..EngineConfig::default()
                },
            );

            let report = engine.start(&runbook(nodes), BTreeMap::new()).await.unwrap();
            assert_eq!(report.status, RunStatus::Ok);

            let rows = executions::executions_for(&store, "prop", report.run_id)
                .await
                .unwrap();
            for (i, &failures) in failures_per_node.iter().enumerate() {
                let id = format!("n{i}");
                let attempts: Vec<i64> = rows
                    .iter()
                    .filter(|r| r.node_id == id)
                    .map(|r| r.attempt)
                    .collect();
                let expected: Vec<i64> = (1..=(failures as i64 + 1)).collect();
                assert_eq!(attempts, expected, "node {id}");
            }
        });
    }

    /// The value templates see is always the highest-precedence supplied
    /// layer: override > file > default.
    #[test]
    fn variable_precedence_highest_wins(
        use_default in any::<bool>(),
        use_file in any::<bool>(),
        use_override in any::<bool>(),
    ) {
        prop_assume!(use_default || use_file || use_override);

        let mut specs = BTreeMap::new();
        specs.insert(
            "V".to_string(),
            VariableSpec {
                default: use_default.then(|| serde_json::json!("from-default")),
                ..VariableSpec::default()
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let file = if use_file {
            let path = dir.path().join("vars.json");
            std::fs::File::create(&path)
                .unwrap()
                .write_all(br#"{"V": "from-file"}"#)
                .unwrap();
            Some(path)
        } else {
            None
        };

        let sources = VariableSources {
            overrides: if use_override {
                BTreeMap::from([("V".to_string(), serde_json::json!("from-override"))])
            } else {
                BTreeMap::new()
            },
            file,
            env_prefix: None,
        };

        let resolved = vars::resolve(&specs, &sources, None).unwrap();
        let expected = if use_override {
            "from-override"
        } else if use_file {
            "from-file"
        } else {
            "from-default"
        };
        prop_assert_eq!(resolved.get("V"), Some(&serde_json::json!(expected)));
    }

    /// A failing critical node ends the run NOK and nothing downstream of
    /// it ever gets an execution row.
    #[test]
    fn critical_failure_stops_downstream(
        chain_len in 2usize..6,
        fail_at in 0usize..5,
    ) {
        prop_assume!(fail_at < chain_len);
        runtime().block_on(async {
            let store = Store::in_memory().await.unwrap();
            let mock = Arc::new(MockRunner::new());

            let mut nodes = Vec::new();
            for i in 0..chain_len {
                let id = format!("n{i}");
                let mut node = command_node(&id);
                if i == fail_at {
                    node.critical = true;
                    mock.script(id.clone(), vec![Outcome::nok("boom")]);
                }
                if i > 0 {
                    node.depends_on = DependsOn::Explicit(vec![format!("n{}", i - 1)]);
                }
                nodes.push(node);
            }

            let runner: Arc<dyn Runner> = mock.clone();
            let engine = Engine::new(
                store.clone(),
                RunnerSet::uniform(runner),
                Arc::new(NeverAsked),
                EngineConfig {
                    max_retries: 0,
                    interactive: false,
                    ..EngineConfig::default()
                },
            );

            let report = engine.start(&runbook(nodes), BTreeMap::new()).await.unwrap();
            assert_eq!(report.status, RunStatus::Nok);

            let rows = executions::executions_for(&store, "prop", report.run_id)
                .await
                .unwrap();
            for i in 0..chain_len {
                let id = format!("n{i}");
                let node_rows: Vec<_> = rows.iter().filter(|r| r.node_id == id).collect();
                if i < fail_at {
                    assert_eq!(node_rows.len(), 1, "upstream node {id} ran once");
                    assert_eq!(node_rows[0].node_status().unwrap(), NodeStatus::Ok);
                } else if i == fail_at {
                    assert!(!node_rows.is_empty());
                } else {
                    assert!(node_rows.is_empty(), "downstream node {id} must not run");
                    assert!(report.not_run.contains(&id));
                }
            }
        });
    }
}
