pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod handler;
pub mod types;

pub use context::{DiagnosticContext, StaticContext};
pub use error::EngineError;
pub use executor::{AgentOrchestrator, ExecuteOptions};
pub use graph::{NodeType, Workflow, WorkflowDefinition, WorkflowEdge, WorkflowNode};
pub use handler::{NodeHandler, handler_fn};
