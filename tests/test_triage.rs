//! End-to-end runs of the bundled triage workflow.

use std::sync::Arc;

use diagflow::engine::types::*;
use diagflow::engine::{AgentOrchestrator, ExecuteOptions, StaticContext};
use diagflow::state::{StateManager, StateManagerConfig};
use diagflow::storage::{RecoveryQuery, SessionStatus};
use diagflow::workflows::triage::{ESCALATE_PROMPT, TRIAGE_WORKFLOW_ID, triage_definition};

async fn setup() -> (Arc<StateManager>, AgentOrchestrator) {
    let manager = Arc::new(
        StateManager::open(StateManagerConfig::in_memory())
            .await
            .unwrap(),
    );
    let orch = AgentOrchestrator::new(manager.clone());
    orch.create_workflow(triage_definition(true)).unwrap();
    (manager, orch)
}

fn run(findings: Vec<Finding>, thread: &str) -> ExecuteOptions {
    ExecuteOptions::new(Arc::new(StaticContext::new("tcp://probe.local:7000")))
        .thread(thread)
        .findings(findings)
}

#[tokio::test]
async fn clean_findings_reach_report() {
    let (_m, orch) = setup().await;

    let findings = vec![
        Finding::new("tls", Severity::Minor, "weak cipher"),
        Finding::new("tls", Severity::Major, "old protocol"),
        Finding::new("banner", Severity::Info, "version leak"),
    ];
    let result = orch
        .execute_workflow(TRIAGE_WORKFLOW_ID, run(findings, "t1"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state.visited_nodes, vec!["collect", "assess", "report"]);
    assert_eq!(result.state.finding_count, 2);
    assert_eq!(result.state.severity, Some(Severity::Major));
    assert!(!result.state.awaiting_user_input);
    assert_eq!(
        result.state.value("duplicates_dropped"),
        Some(&serde_json::json!(1))
    );
    assert_eq!(
        result.state.value("summary"),
        Some(&serde_json::json!({ "info": 1, "major": 1 }))
    );
    assert_eq!(
        result.state.value("verdict"),
        Some(&serde_json::json!("2 finding(s), highest severity major"))
    );
}

#[tokio::test]
async fn blockers_wait_for_operator() {
    let (m, orch) = setup().await;
    let sid = m
        .create_session(TRIAGE_WORKFLOW_ID, "t2", None)
        .await
        .unwrap();

    let findings = vec![Finding::new("auth", Severity::Blocker, "anonymous admin")];
    let result = orch
        .execute_workflow(TRIAGE_WORKFLOW_ID, run(findings, "t2"))
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.state.awaiting_user_input);
    assert_eq!(result.state.user_prompt.as_deref(), Some(ESCALATE_PROMPT));
    assert_eq!(result.state.visited_nodes, vec!["collect", "assess", "escalate"]);
    assert_eq!(result.state.severity, Some(Severity::Blocker));

    let session = m.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.last_checkpoint_id, result.checkpoint_id);

    let recovered = m
        .recover_state(&RecoveryQuery::new(TRIAGE_WORKFLOW_ID).thread("t2"))
        .await
        .unwrap()
        .unwrap();
    assert!(recovered.state.awaiting_user_input);
    assert_eq!(recovered.state.current_node, "escalate");

    let hops: Vec<String> = m
        .get_transition_history(TRIAGE_WORKFLOW_ID, Some("t2"))
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.to_node)
        .collect();
    assert_eq!(hops, vec!["collect", "assess", "escalate"]);
}

#[tokio::test]
async fn no_findings_reports_nothing() {
    let (_m, orch) = setup().await;

    let result = orch
        .execute_workflow(TRIAGE_WORKFLOW_ID, run(Vec::new(), "t3"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state.severity, None);
    assert_eq!(
        result.state.value("verdict"),
        Some(&serde_json::json!("no findings"))
    );
}
