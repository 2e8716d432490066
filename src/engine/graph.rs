use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;
use crate::engine::handler::NodeHandler;
use crate::engine::types::{WorkflowConfig, WorkflowState};
use crate::state::checkpointer::Checkpointer;

/// Built-in behavior of a node, applied around its optional handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Aggregation,
    Decision,
    HumanInput,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Aggregation => write!(f, "aggregation"),
            NodeType::Decision => write!(f, "decision"),
            NodeType::HumanInput => write!(f, "human_input"),
        }
    }
}

/// Guard predicate evaluated against the state after the source node ran.
pub type EdgeCondition = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub handler: Option<Arc<dyn NodeHandler>>,
}

impl WorkflowNode {
    pub fn new(id: &str, name: &str, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            node_type,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn NodeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Readable label used in `execution_path`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.node_type)
    }
}

impl std::fmt::Debug for WorkflowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

impl WorkflowEdge {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        }
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// An edge without a condition always qualifies.
    pub fn admits(&self, state: &WorkflowState) -> bool {
        self.condition.as_ref().is_none_or(|c| c(state))
    }
}

impl std::fmt::Debug for WorkflowEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEdge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Author-supplied blueprint of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub config: WorkflowConfig,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    pub entry_point: String,
}

impl WorkflowDefinition {
    pub fn new(config: WorkflowConfig, entry_point: &str) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_point: entry_point.to_string(),
        }
    }

    pub fn node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Structural problems that prevent compilation, in discovery order.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.config.workflow_id.trim().is_empty() {
            errors.push("workflow id must not be empty".to_string());
        }

        let mut declared: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !declared.insert(node.id.as_str()) {
                errors.push(format!("duplicate node id '{}'", node.id));
            }
        }

        if !declared.contains(self.entry_point.as_str()) {
            errors.push(format!(
                "entry point '{}' is not a declared node",
                self.entry_point
            ));
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !declared.contains(end.as_str()) {
                    errors.push(format!(
                        "edge '{}' -> '{}' references undeclared node '{}'",
                        edge.from, edge.to, end
                    ));
                }
            }
        }

        errors
    }
}

/// A validated workflow with its graph indexed for the walk.
pub struct Workflow {
    pub config: WorkflowConfig,
    pub entry_point: String,
    nodes: HashMap<String, WorkflowNode>,
    node_order: Vec<String>,
    /// Outgoing edges per node, kept in declaration order.
    outgoing: HashMap<String, Vec<WorkflowEdge>>,
    checkpointer: Option<Arc<Checkpointer>>,
}

impl Workflow {
    /// Validate a definition and build its adjacency structure.
    pub fn compile(
        definition: WorkflowDefinition,
        checkpointer: Option<Arc<Checkpointer>>,
    ) -> Result<Self, EngineError> {
        let errors = definition.validate();
        if !errors.is_empty() {
            return Err(EngineError::validation(format!(
                "workflow '{}': {}",
                definition.config.workflow_id,
                errors.join("; ")
            )));
        }

        let node_order: Vec<String> = definition.nodes.iter().map(|n| n.id.clone()).collect();

        let mut outgoing: HashMap<String, Vec<WorkflowEdge>> = HashMap::new();
        for edge in definition.edges {
            outgoing.entry(edge.from.clone()).or_default().push(edge);
        }

        let nodes = definition
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        Ok(Self {
            config: definition.config,
            entry_point: definition.entry_point,
            nodes,
            node_order,
            outgoing,
            checkpointer,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.workflow_id
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn outgoing(&self, id: &str) -> &[WorkflowEdge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First outgoing edge whose guard admits the state.
    pub fn next_edge(&self, id: &str, state: &WorkflowState) -> Option<&WorkflowEdge> {
        self.outgoing(id).iter().find(|e| e.admits(state))
    }

    pub fn checkpointer(&self) -> Option<&Arc<Checkpointer>> {
        self.checkpointer.as_ref()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.config.workflow_id)
            .field("entry_point", &self.entry_point)
            .field("nodes", &self.node_order)
            .field("checkpointing", &self.checkpointer.is_some())
            .finish()
    }
}
