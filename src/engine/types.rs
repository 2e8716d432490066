use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::context::DiagnosticContext;

/// Author-defined scratch values carried in the workflow state.
pub type Values = HashMap<String, serde_json::Value>;

/// Seriousness of a diagnostic finding. Ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Blocker,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Minor => write!(f, "minor"),
            Severity::Major => write!(f, "major"),
            Severity::Blocker => write!(f, "blocker"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "minor" => Ok(Severity::Minor),
            "major" => Ok(Severity::Major),
            "blocker" => Ok(Severity::Blocker),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// A single diagnostic observation produced by a probe or check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<serde_json::Value>,
}

impl Finding {
    pub fn new(id: &str, severity: Severity, title: &str) -> Self {
        Self {
            id: id.to_string(),
            severity,
            title: title.to_string(),
            detail: None,
            evidence: None,
        }
    }
}

/// Static configuration of a workflow, shared by the definition and every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enable_checkpointing: bool,
    /// Upper bound on node executions per run; guards against cyclic graphs.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    1000
}

impl WorkflowConfig {
    pub fn new(workflow_id: &str, name: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            enable_checkpointing: false,
            max_steps: default_max_steps(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_checkpointing(mut self, enabled: bool) -> Self {
        self.enable_checkpointing = enabled;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// The mutable execution record threaded through node handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub endpoint: String,
    pub findings: Vec<Finding>,
    pub errors: Vec<String>,
    pub current_node: String,
    pub visited_nodes: Vec<String>,
    pub execution_path: Vec<String>,
    pub severity: Option<Severity>,
    pub finding_count: usize,
    pub has_blockers: bool,
    pub has_major: bool,
    pub awaiting_user_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub values: Values,
    pub config: WorkflowConfig,
    pub start_time: DateTime<Utc>,
    /// Node id -> elapsed milliseconds of its last execution.
    pub node_timings: BTreeMap<String, f64>,
    #[serde(skip)]
    pub context: Option<Arc<dyn DiagnosticContext>>,
}

impl WorkflowState {
    pub fn new(
        config: WorkflowConfig,
        endpoint: &str,
        entry_point: &str,
        findings: Vec<Finding>,
        context: Option<Arc<dyn DiagnosticContext>>,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            findings,
            errors: Vec::new(),
            current_node: entry_point.to_string(),
            visited_nodes: Vec::new(),
            execution_path: Vec::new(),
            severity: None,
            finding_count: 0,
            has_blockers: false,
            has_major: false,
            awaiting_user_input: false,
            user_prompt: None,
            values: Values::new(),
            config,
            start_time: Utc::now(),
            node_timings: BTreeMap::new(),
            context,
        }
    }

    /// Look up a scratch value.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Downcast the attached diagnostic context to its concrete type.
    pub fn context_as<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// Most serious severity among the accumulated findings.
    pub fn max_finding_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Recompute the derived finding counters.
    pub fn refresh_finding_summary(&mut self) {
        self.finding_count = self.findings.len();
        self.has_blockers = self.findings.iter().any(|f| f.severity == Severity::Blocker);
        self.has_major = self.findings.iter().any(|f| f.severity == Severity::Major);
    }

    /// Shallow-merge a handler patch. Arrays replace; `values` merge per key.
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(endpoint) = patch.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(findings) = patch.findings {
            self.findings = findings;
        }
        if let Some(errors) = patch.errors {
            self.errors = errors;
        }
        if let Some(visited) = patch.visited_nodes {
            if visited.starts_with(&self.visited_nodes) {
                self.visited_nodes = visited;
            } else {
                warn!(node = %self.current_node, "Ignoring visited_nodes patch that drops entries");
            }
        }
        if let Some(path) = patch.execution_path {
            if path.starts_with(&self.execution_path) {
                self.execution_path = path;
            } else {
                warn!(node = %self.current_node, "Ignoring execution_path patch that drops entries");
            }
        }
        if let Some(severity) = patch.severity {
            self.severity = severity;
        }
        if let Some(count) = patch.finding_count {
            self.finding_count = count;
        }
        if let Some(flag) = patch.has_blockers {
            self.has_blockers = flag;
        }
        if let Some(flag) = patch.has_major {
            self.has_major = flag;
        }
        if let Some(flag) = patch.awaiting_user_input {
            self.awaiting_user_input = flag;
        }
        if let Some(prompt) = patch.user_prompt {
            self.user_prompt = Some(prompt);
        }
        for (k, v) in patch.values {
            self.values.insert(k, v);
        }
    }
}

/// Partial update returned by a node handler. `Some` fields replace the prior value.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub endpoint: Option<String>,
    pub findings: Option<Vec<Finding>>,
    pub errors: Option<Vec<String>>,
    pub visited_nodes: Option<Vec<String>>,
    pub execution_path: Option<Vec<String>>,
    /// `Some(None)` clears the severity.
    pub severity: Option<Option<Severity>>,
    /// Aggregation and decision nodes recompute the three finding counters
    /// from `findings` unless the patch sets them.
    pub finding_count: Option<usize>,
    pub has_blockers: Option<bool>,
    pub has_major: Option<bool>,
    pub awaiting_user_input: Option<bool>,
    pub user_prompt: Option<String>,
    pub values: Values,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = Some(findings);
        self
    }

    pub fn errors(mut self, errors: Vec<String>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn visited_nodes(mut self, visited: Vec<String>) -> Self {
        self.visited_nodes = Some(visited);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(Some(severity));
        self
    }

    pub fn user_prompt(mut self, prompt: &str) -> Self {
        self.user_prompt = Some(prompt.to_string());
        self
    }

    pub fn value(mut self, key: &str, value: serde_json::Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

/// Outcome of one `execute_workflow` call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub state: WorkflowState,
    pub execution_time_ms: f64,
    pub thread_id: String,
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeEnter,
    NodeExit,
}

/// Streamed to the caller's event callback around each node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub node_id: String,
    pub kind: EventKind,
}

pub type EventCallback = Arc<dyn Fn(&WorkflowEvent) -> anyhow::Result<()> + Send + Sync>;
