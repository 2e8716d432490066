use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::engine::graph::{NodeType, WorkflowDefinition, WorkflowEdge, WorkflowNode};
use crate::engine::handler::handler_fn;
use crate::engine::types::{Finding, StatePatch, WorkflowConfig, WorkflowState};

pub const TRIAGE_WORKFLOW_ID: &str = "triage";

pub const ESCALATE_PROMPT: &str = "Blocker findings need operator review";

/// Collapse findings sharing an id, keeping the most serious occurrence.
/// First-seen order is preserved.
pub fn dedupe_findings(findings: &[Finding]) -> Vec<Finding> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, Finding> = HashMap::new();

    for f in findings {
        let more_serious = best.get(&f.id).map(|held| f.severity > held.severity);
        match more_serious {
            Some(false) => {}
            Some(true) => {
                best.insert(f.id.clone(), f.clone());
            }
            None => {
                order.push(f.id.clone());
                best.insert(f.id.clone(), f.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| best.remove(&id))
        .collect()
}

fn severity_counts(state: &WorkflowState) -> serde_json::Value {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for f in &state.findings {
        *counts.entry(f.severity.to_string()).or_insert(0) += 1;
    }
    serde_json::json!(counts)
}

async fn collect(state: WorkflowState) -> Result<StatePatch> {
    let unique = dedupe_findings(&state.findings);
    let dropped = state.findings.len() - unique.len();
    Ok(StatePatch::new()
        .findings(unique)
        .value("duplicates_dropped", serde_json::json!(dropped)))
}

async fn report(state: WorkflowState) -> Result<StatePatch> {
    let verdict = match state.severity {
        Some(s) => format!("{} finding(s), highest severity {}", state.finding_count, s),
        None => "no findings".to_string(),
    };
    Ok(StatePatch::new()
        .value("summary", severity_counts(&state))
        .value("verdict", serde_json::json!(verdict)))
}

/// Aggregate → decide → escalate blockers to an operator, otherwise report.
pub fn triage_definition(enable_checkpointing: bool) -> WorkflowDefinition {
    let config = WorkflowConfig::new(TRIAGE_WORKFLOW_ID, "Finding triage")
        .with_description("Deduplicate probe findings, grade them and route blockers to a human")
        .with_checkpointing(enable_checkpointing);

    WorkflowDefinition::new(config, "collect")
        .node(
            WorkflowNode::new("collect", "Collect findings", NodeType::Aggregation)
                .with_handler(handler_fn(collect)),
        )
        .node(WorkflowNode::new("assess", "Assess severity", NodeType::Decision))
        .node(WorkflowNode::new("escalate", ESCALATE_PROMPT, NodeType::HumanInput))
        .node(
            WorkflowNode::new("report", "Report", NodeType::Aggregation)
                .with_handler(handler_fn(report)),
        )
        .edge(WorkflowEdge::new("collect", "assess"))
        .edge(WorkflowEdge::new("assess", "escalate").when(|s| s.has_blockers))
        .edge(WorkflowEdge::new("assess", "report"))
}
