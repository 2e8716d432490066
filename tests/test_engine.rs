//! Integration tests for the workflow orchestrator and graph walk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use diagflow::engine::types::*;
use diagflow::engine::*;
use diagflow::state::{StateManager, StateManagerConfig};
use diagflow::storage::memory_store::MemoryStateStore;

fn manager() -> Arc<StateManager> {
    Arc::new(StateManager::with_store(
        StateManagerConfig::in_memory(),
        Arc::new(MemoryStateStore::new()),
    ))
}

fn orchestrator() -> AgentOrchestrator {
    AgentOrchestrator::new(manager())
}

fn options() -> ExecuteOptions {
    ExecuteOptions::new(Arc::new(StaticContext::new("tcp://probe.local:7000")))
}

fn config(id: &str) -> WorkflowConfig {
    WorkflowConfig::new(id, id)
}

// --- Basic walk ---

#[tokio::test]
async fn single_node_runs_handler() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("single"), "a").node(
        WorkflowNode::new("a", "Aggregate", NodeType::Aggregation).with_handler(handler_fn(
            |_state| async move { Ok(StatePatch::new().value("x", serde_json::json!(1))) },
        )),
    );
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("single", options()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.state.value("x"), Some(&serde_json::json!(1)));
    assert_eq!(result.state.visited_nodes, vec!["a"]);
    assert_eq!(result.state.execution_path, vec!["Aggregate (aggregation)"]);
    assert_eq!(result.state.current_node, "a");
    assert!(result.state.node_timings.contains_key("a"));
    assert!(result.thread_id.starts_with("thread-"));
    assert!(result.checkpoint_id.is_none());
    assert!(result.execution_time_ms >= 0.0);
}

#[tokio::test]
async fn endpoint_falls_back_to_context() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("ep"), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation)),
    )
    .unwrap();

    let result = orch.execute_workflow("ep", options()).await.unwrap();
    assert_eq!(result.state.endpoint, "tcp://probe.local:7000");

    let result = orch
        .execute_workflow("ep", options().endpoint("tcp://other:1"))
        .await
        .unwrap();
    assert_eq!(result.state.endpoint, "tcp://other:1");
}

#[tokio::test]
async fn handler_sees_context() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("ctx"), "a").node(
        WorkflowNode::new("a", "A", NodeType::Aggregation).with_handler(handler_fn(
            |state| async move {
                let ctx = state
                    .context_as::<StaticContext>()
                    .ok_or_else(|| anyhow::anyhow!("no context"))?;
                let banner = ctx.evidence.get("banner").cloned().unwrap_or_default();
                Ok(StatePatch::new().value("banner", banner))
            },
        )),
    );
    orch.create_workflow(def).unwrap();

    let ctx = StaticContext::new("tcp://x:1").with_evidence("banner", serde_json::json!("v2"));
    let result = orch
        .execute_workflow("ctx", ExecuteOptions::new(Arc::new(ctx)))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state.value("banner"), Some(&serde_json::json!("v2")));
}

#[tokio::test]
async fn linear_chain_visits_in_order() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("chain"), "a")
        .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
        .node(WorkflowNode::new("b", "B", NodeType::Decision))
        .node(WorkflowNode::new("c", "C", NodeType::Aggregation))
        .edge(WorkflowEdge::new("a", "b"))
        .edge(WorkflowEdge::new("b", "c"));
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("chain", options()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.state.visited_nodes, vec!["a", "b", "c"]);
    assert_eq!(
        result.state.execution_path,
        vec!["A (aggregation)", "B (decision)", "C (aggregation)"]
    );
    assert_eq!(result.state.node_timings.len(), 3);
}

// --- Built-in node behavior ---

#[tokio::test]
async fn aggregation_refreshes_finding_counters() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("agg"), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation)),
    )
    .unwrap();

    let findings = vec![
        Finding::new("f1", Severity::Major, "slow handshake"),
        Finding::new("f2", Severity::Info, "banner"),
    ];
    let result = orch
        .execute_workflow("agg", options().findings(findings))
        .await
        .unwrap();

    assert_eq!(result.state.finding_count, 2);
    assert!(result.state.has_major);
    assert!(!result.state.has_blockers);
    assert_eq!(result.state.severity, None);
}

#[tokio::test]
async fn decision_escalates_to_blocker() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("dec"), "d")
            .node(WorkflowNode::new("d", "Decide", NodeType::Decision)),
    )
    .unwrap();

    let findings = vec![
        Finding::new("f1", Severity::Minor, "a"),
        Finding::new("f2", Severity::Blocker, "b"),
    ];
    let result = orch
        .execute_workflow("dec", options().findings(findings))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state.severity, Some(Severity::Blocker));
    assert!(result.state.has_blockers);
}

#[tokio::test]
async fn decision_keeps_handler_severity() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("dec2"), "d").node(
            WorkflowNode::new("d", "Decide", NodeType::Decision).with_handler(handler_fn(
                |_s| async move { Ok(StatePatch::new().severity(Severity::Minor)) },
            )),
        ),
    )
    .unwrap();

    let findings = vec![Finding::new("f", Severity::Blocker, "b")];
    let result = orch
        .execute_workflow("dec2", options().findings(findings))
        .await
        .unwrap();

    assert_eq!(result.state.severity, Some(Severity::Minor));
}

#[tokio::test]
async fn human_input_stops_the_walk() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("hi"), "a")
        .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
        .node(WorkflowNode::new("ask", "Confirm the rollout", NodeType::HumanInput))
        .node(WorkflowNode::new("after", "After", NodeType::Aggregation))
        .edge(WorkflowEdge::new("a", "ask"))
        .edge(WorkflowEdge::new("ask", "after"));
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("hi", options()).await.unwrap();

    assert!(result.success);
    assert!(result.state.awaiting_user_input);
    assert_eq!(
        result.state.user_prompt.as_deref(),
        Some("Confirm the rollout")
    );
    assert_eq!(result.state.visited_nodes, vec!["a", "ask"]);
    assert_eq!(result.state.current_node, "ask");
}

// --- Routing ---

fn routed(id: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(config(id), "d")
        .node(WorkflowNode::new("d", "Decide", NodeType::Decision))
        .node(WorkflowNode::new("block", "Block", NodeType::Aggregation))
        .node(WorkflowNode::new("pass", "Pass", NodeType::Aggregation))
        .edge(WorkflowEdge::new("d", "block").when(|s| s.has_blockers))
        .edge(WorkflowEdge::new("d", "pass"))
}

#[tokio::test]
async fn conditional_edge_taken_when_guard_holds() {
    let orch = orchestrator();
    orch.create_workflow(routed("route")).unwrap();

    let result = orch
        .execute_workflow(
            "route",
            options().findings(vec![Finding::new("f", Severity::Blocker, "x")]),
        )
        .await
        .unwrap();
    assert_eq!(result.state.visited_nodes, vec!["d", "block"]);

    let result = orch
        .execute_workflow(
            "route",
            options().findings(vec![Finding::new("f", Severity::Minor, "x")]),
        )
        .await
        .unwrap();
    assert_eq!(result.state.visited_nodes, vec!["d", "pass"]);
}

#[tokio::test]
async fn no_matching_edge_ends_without_error() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("dead"), "a")
        .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
        .node(WorkflowNode::new("b", "B", NodeType::Aggregation))
        .edge(WorkflowEdge::new("a", "b").when(|_| false));
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("dead", options()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.state.visited_nodes, vec!["a"]);
}

#[tokio::test]
async fn cycle_is_bounded_by_step_limit() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("loop").with_max_steps(5), "a")
        .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
        .node(WorkflowNode::new("b", "B", NodeType::Aggregation))
        .edge(WorkflowEdge::new("a", "b"))
        .edge(WorkflowEdge::new("b", "a"));
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("loop", options()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.state.visited_nodes.len(), 5);
    assert!(result.state.errors[0].contains("step limit"));
}

// --- Failures ---

#[tokio::test]
async fn handler_error_is_recorded_and_stops() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("fail"), "a")
        .node(
            WorkflowNode::new("a", "A", NodeType::Aggregation).with_handler(handler_fn(
                |_s| async move { Err(anyhow::anyhow!("boom")) },
            )),
        )
        .node(WorkflowNode::new("b", "B", NodeType::Aggregation))
        .edge(WorkflowEdge::new("a", "b"));
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("fail", options()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.state.errors.len(), 1);
    assert!(result.state.errors[0].contains("boom"));
    assert!(result.state.errors[0].contains("'a'"));
    assert_eq!(result.state.visited_nodes, vec!["a"]);
}

#[tokio::test]
async fn handler_panic_is_recorded() {
    let orch = orchestrator();
    let def = WorkflowDefinition::new(config("panic"), "a").node(
        WorkflowNode::new("a", "A", NodeType::Aggregation).with_handler(handler_fn(
            |_s| async move {
                if true {
                    panic!("probe crashed");
                }
                Ok(StatePatch::new())
            },
        )),
    );
    orch.create_workflow(def).unwrap();

    let result = orch.execute_workflow("panic", options()).await.unwrap();

    assert!(!result.success);
    assert!(result.state.errors[0].contains("probe crashed"));
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let orch = orchestrator();
    let err = orch
        .execute_workflow("ghost", options())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn missing_context_is_rejected() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("noctx"), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation)),
    )
    .unwrap();

    let err = orch
        .execute_workflow("noctx", ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(err.to_string().contains("initial context"));
}

#[tokio::test]
async fn invalid_definitions_are_rejected() {
    let orch = orchestrator();

    let err = orch
        .create_workflow(
            WorkflowDefinition::new(config("bad"), "missing")
                .node(WorkflowNode::new("a", "A", NodeType::Aggregation)),
        )
        .unwrap_err();
    assert!(err.to_string().contains("entry point 'missing'"));

    let err = orch
        .create_workflow(
            WorkflowDefinition::new(config("bad"), "a")
                .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
                .edge(WorkflowEdge::new("a", "nowhere")),
        )
        .unwrap_err();
    assert!(err.to_string().contains("nowhere"));

    let err = orch
        .create_workflow(
            WorkflowDefinition::new(config("bad"), "a")
                .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
                .node(WorkflowNode::new("a", "A again", NodeType::Decision)),
        )
        .unwrap_err();
    assert!(err.to_string().contains("duplicate node id 'a'"));

    assert!(orch.get_workflow("bad").is_none());
}

// --- Events ---

#[tokio::test]
async fn events_stream_enter_and_exit() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("ev"), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
            .node(WorkflowNode::new("b", "B", NodeType::Aggregation))
            .edge(WorkflowEdge::new("a", "b")),
    )
    .unwrap();

    let seen: Arc<Mutex<Vec<(String, EventKind)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let opts = options().on_event(move |e| {
        sink.lock().unwrap().push((e.node_id.clone(), e.kind));
        Ok(())
    });

    orch.execute_workflow("ev", opts).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            ("a".to_string(), EventKind::NodeEnter),
            ("a".to_string(), EventKind::NodeExit),
            ("b".to_string(), EventKind::NodeEnter),
            ("b".to_string(), EventKind::NodeExit),
        ]
    );
}

#[tokio::test]
async fn failing_event_callback_does_not_abort() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("ev2"), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation)),
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let opts = options().on_event(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("listener gone");
        }
        panic!("listener crashed");
    });

    let result = orch.execute_workflow("ev2", opts).await.unwrap();

    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// --- Registry and checkpointing ---

#[tokio::test]
async fn registry_lists_and_deletes() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("b"), "n")
            .node(WorkflowNode::new("n", "N", NodeType::Aggregation)),
    )
    .unwrap();
    orch.create_workflow(
        WorkflowDefinition::new(config("a").with_checkpointing(true), "n")
            .node(WorkflowNode::new("n", "N", NodeType::Aggregation)),
    )
    .unwrap();

    let ids: Vec<String> = orch
        .list_workflows()
        .iter()
        .map(|w| w.id().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    assert!(orch.get_checkpointer("a").is_some());
    assert!(orch.get_checkpointer("b").is_none());

    assert!(orch.delete_workflow("a"));
    assert!(!orch.delete_workflow("a"));
    assert!(orch.get_workflow("a").is_none());
}

#[tokio::test]
async fn checkpointed_run_saves_state_and_transitions() {
    let manager = manager();
    let orch = AgentOrchestrator::new(manager.clone());
    orch.create_workflow(
        WorkflowDefinition::new(config("cp").with_checkpointing(true), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation))
            .node(WorkflowNode::new("b", "B", NodeType::Decision))
            .edge(WorkflowEdge::new("a", "b")),
    )
    .unwrap();

    let result = orch
        .execute_workflow("cp", options().thread("t1"))
        .await
        .unwrap();

    assert_eq!(result.thread_id, "t1");
    let cp_id = result.checkpoint_id.clone().unwrap();
    assert!(cp_id.starts_with("cp-"));

    let saved = manager.load_checkpoint(&cp_id).await.unwrap().unwrap();
    assert_eq!(saved.workflow_id, "cp");
    assert_eq!(saved.thread_id, "t1");
    assert_eq!(saved.state.visited_nodes, vec!["a", "b"]);
    assert!(saved.state.context.is_none());
    let meta = saved.metadata.unwrap();
    assert_eq!(meta["source"], "execution");
    assert_eq!(meta["success"], true);
    assert_eq!(meta["step_count"], 2);

    let history = manager
        .get_transition_history("cp", Some("t1"))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from_node, None);
    assert_eq!(history[0].to_node, "a");
    assert_eq!(history[0].transition_type, "entry");
    assert_eq!(history[1].from_node.as_deref(), Some("a"));
    assert_eq!(history[1].to_node, "b");
    assert_eq!(history[1].transition_type, "normal");
    assert!(history[1].duration_ms.is_some());
    assert!(history.iter().all(|t| t.checkpoint_id == cp_id));

    let checkpointer = orch.get_checkpointer("cp").unwrap();
    let latest = checkpointer.latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_id, cp_id);
    assert_eq!(checkpointer.memory().len(), 1);
}

#[tokio::test]
async fn storage_fault_surfaces_as_error() {
    let manager = manager();
    let orch = AgentOrchestrator::new(manager.clone());
    orch.create_workflow(
        WorkflowDefinition::new(config("closed").with_checkpointing(true), "a")
            .node(WorkflowNode::new("a", "A", NodeType::Aggregation)),
    )
    .unwrap();

    manager.close().await.unwrap();

    let err = orch
        .execute_workflow("closed", options())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_keep_their_own_records() {
    use diagflow::storage::RecoveryQuery;

    let manager = Arc::new(
        StateManager::open(StateManagerConfig {
            enable_auto_save: true,
            auto_save_interval_ms: Some(5),
            ..StateManagerConfig::in_memory()
        })
        .await
        .unwrap(),
    );
    let orch = Arc::new(AgentOrchestrator::new(manager.clone()));
    orch.create_workflow(
        WorkflowDefinition::new(config("conc").with_checkpointing(true), "a")
            .node(
                WorkflowNode::new("a", "A", NodeType::Aggregation).with_handler(handler_fn(
                    |_s| async move {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(StatePatch::new())
                    },
                )),
            )
            .node(WorkflowNode::new("b", "B", NodeType::Decision))
            .edge(WorkflowEdge::new("a", "b")),
    )
    .unwrap();

    let mut sessions = Vec::new();
    for i in 0..16 {
        let thread = format!("t{}", i);
        let sid = manager.create_session("conc", &thread, None).await.unwrap();
        sessions.push((thread, sid));
    }

    // Auto-save races the run on the same scope as t0.
    let snapshot = WorkflowState::new(config("conc"), "tcp://snap:1", "a", Vec::new(), None);
    assert!(manager.enable_auto_save("conc", "t0", move || snapshot.clone()));

    let mut handles = Vec::new();
    for (thread, _) in &sessions {
        let orch = orch.clone();
        let thread = thread.clone();
        handles.push(tokio::spawn(async move {
            orch.execute_workflow("conc", options().thread(&thread))
                .await
                .unwrap()
        }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    assert!(manager.disable_auto_save("conc", "t0"));

    for ((thread, sid), result) in sessions.iter().zip(&results) {
        assert!(result.success);
        assert_eq!(&result.thread_id, thread);
        let cp_id = result.checkpoint_id.clone().unwrap();

        let history = manager
            .get_transition_history("conc", Some(thread.as_str()))
            .await
            .unwrap();
        let kinds: Vec<&str> = history.iter().map(|t| t.transition_type.as_str()).collect();
        assert_eq!(kinds, vec!["entry", "normal"]);
        assert!(history.iter().all(|t| t.checkpoint_id == cp_id));

        let saved = manager.load_checkpoint(&cp_id).await.unwrap().unwrap();
        assert_eq!(&saved.thread_id, thread);
        assert_eq!(saved.state.visited_nodes, vec!["a", "b"]);

        let recovered = manager
            .recover_state(&RecoveryQuery::new("conc").thread(thread))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&recovered.thread_id, thread);

        if thread != "t0" {
            assert_eq!(recovered.checkpoint_id, cp_id);
            let session = manager.get_session(sid).await.unwrap().unwrap();
            assert_eq!(session.last_checkpoint_id.as_deref(), Some(cp_id.as_str()));
        }
    }

    assert_eq!(
        manager.get_transition_history("conc", None).await.unwrap().len(),
        32
    );
    manager.close().await.unwrap();
}

#[tokio::test]
async fn handler_set_counters_survive_refresh() {
    let orch = orchestrator();
    orch.create_workflow(
        WorkflowDefinition::new(config("pin"), "d")
            .node(
                WorkflowNode::new("d", "Decide", NodeType::Decision).with_handler(handler_fn(
                    |_s| async move {
                        let mut patch = StatePatch::new();
                        patch.has_blockers = Some(false);
                        patch.finding_count = Some(0);
                        Ok(patch)
                    },
                )),
            )
            .node(WorkflowNode::new("block", "Block", NodeType::Aggregation))
            .node(WorkflowNode::new("pass", "Pass", NodeType::Aggregation))
            .edge(WorkflowEdge::new("d", "block").when(|s| s.has_blockers))
            .edge(WorkflowEdge::new("d", "pass")),
    )
    .unwrap();

    let findings = vec![
        Finding::new("f1", Severity::Blocker, "waived"),
        Finding::new("f2", Severity::Major, "slow"),
    ];
    let result = orch
        .execute_workflow("pin", options().findings(findings))
        .await
        .unwrap();

    assert_eq!(result.state.visited_nodes, vec!["d", "pass"]);
    assert_eq!(result.state.severity, Some(Severity::Blocker));
    // "pass" has no handler, so its own refresh recomputes the counters.
    assert_eq!(result.state.finding_count, 2);
    assert!(result.state.has_blockers);
    assert!(result.state.has_major);
}
