use std::any::Any;

use crate::engine::types::Values;

/// Capabilities a diagnostic run hands to node handlers.
///
/// The engine never calls into the context itself: it only stores it in the
/// workflow state so handlers can reach their probes. Handlers recover their
/// concrete type through [`WorkflowState::context_as`](crate::engine::types::WorkflowState::context_as).
pub trait DiagnosticContext: std::fmt::Debug + Send + Sync + 'static {
    /// The server endpoint under inspection.
    fn endpoint(&self) -> &str;

    /// Whether probes should avoid nondeterministic behavior (timestamps, random ids).
    fn deterministic(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// A context with no live probes, carrying only an endpoint and pre-collected evidence.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    pub endpoint: String,
    pub deterministic: bool,
    pub evidence: Values,
}

impl StaticContext {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            deterministic: false,
            evidence: Values::new(),
        }
    }

    pub fn with_evidence(mut self, key: &str, value: serde_json::Value) -> Self {
        self.evidence.insert(key.to_string(), value);
        self
    }
}

impl DiagnosticContext for StaticContext {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn deterministic(&self) -> bool {
        self.deterministic
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
