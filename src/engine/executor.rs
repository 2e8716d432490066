use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures_util::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::context::DiagnosticContext;
use crate::engine::error::EngineError;
use crate::engine::graph::{NodeType, Workflow, WorkflowDefinition, WorkflowNode};
use crate::engine::types::*;
use crate::state::StateManager;
use crate::state::checkpointer::Checkpointer;
use crate::storage::StateTransition;

/// Inputs of one `execute_workflow` call.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub context: Option<Arc<dyn DiagnosticContext>>,
    /// Falls back to the context's endpoint when empty.
    pub endpoint: String,
    pub thread_id: Option<String>,
    pub findings: Vec<Finding>,
    pub stream_events: bool,
    pub on_event: Option<EventCallback>,
}

impl ExecuteOptions {
    pub fn new(context: Arc<dyn DiagnosticContext>) -> Self {
        Self {
            context: Some(context),
            ..Self::default()
        }
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    pub fn findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    /// Stream node enter/exit events to `callback`.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WorkflowEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.stream_events = true;
        self.on_event = Some(Arc::new(callback));
        self
    }
}

enum NodeOutcome {
    Continue,
    Suspended,
    Failed,
}

/// Best-effort event delivery: callback errors and panics are logged, never propagated.
struct EventEmitter {
    callback: Option<EventCallback>,
}

impl EventEmitter {
    fn new(options: &ExecuteOptions) -> Self {
        let callback = if options.stream_events {
            options.on_event.clone()
        } else {
            None
        };
        Self { callback }
    }

    fn emit(&self, node_id: &str, kind: EventKind) {
        let Some(callback) = &self.callback else {
            return;
        };
        let event = WorkflowEvent {
            node_id: node_id.to_string(),
            kind,
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(node = %node_id, error = %e, "Event callback failed"),
            Err(_) => warn!(node = %node_id, "Event callback panicked"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Registry of compiled workflows and the graph walker that runs them.
pub struct AgentOrchestrator {
    state_manager: Arc<StateManager>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl AgentOrchestrator {
    pub fn new(state_manager: Arc<StateManager>) -> Self {
        Self {
            state_manager,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state_manager
    }

    /// Compile and register a definition, replacing any workflow with the same id.
    pub fn create_workflow(&self, definition: WorkflowDefinition) -> Result<Arc<Workflow>, EngineError> {
        let workflow_id = definition.config.workflow_id.clone();
        let checkpointer = definition
            .config
            .enable_checkpointing
            .then(|| Arc::new(Checkpointer::new(self.state_manager.clone(), &workflow_id)));

        let workflow = Arc::new(Workflow::compile(definition, checkpointer)?);

        let replaced = self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_id.clone(), workflow.clone())
            .is_some();

        info!(
            workflow = %workflow_id,
            checkpointing = workflow.checkpointer().is_some(),
            replaced,
            "Workflow registered"
        );
        Ok(workflow)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
    }

    /// Registered workflows ordered by id.
    pub fn list_workflows(&self) -> Vec<Arc<Workflow>> {
        let mut all: Vec<Arc<Workflow>> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn delete_workflow(&self, workflow_id: &str) -> bool {
        let removed = self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workflow_id)
            .is_some();
        if removed {
            info!(workflow = %workflow_id, "Workflow deleted");
        }
        removed
    }

    pub fn get_checkpointer(&self, workflow_id: &str) -> Option<Arc<Checkpointer>> {
        self.get_workflow(workflow_id)?.checkpointer().cloned()
    }

    /// Walk a registered workflow from its entry point.
    ///
    /// Fails only for an unknown workflow, a missing context, or a storage
    /// fault. Handler failures end the walk and are reported through
    /// `ExecutionResult::success` and `state.errors`.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let workflow = self
            .get_workflow(workflow_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{}' not found", workflow_id)))?;

        let context = options.context.clone().ok_or_else(|| {
            EngineError::validation(format!(
                "workflow '{}' requires an initial context",
                workflow_id
            ))
        })?;

        let endpoint = if options.endpoint.is_empty() {
            context.endpoint().to_string()
        } else {
            options.endpoint.clone()
        };
        let thread_id = options
            .thread_id
            .clone()
            .unwrap_or_else(|| format!("thread-{}", Uuid::new_v4()));
        let checkpoint_id = format!("cp-{}", Uuid::new_v4());
        let checkpointer = workflow.checkpointer().cloned();
        let emitter = EventEmitter::new(&options);

        let started = Instant::now();
        let mut state = WorkflowState::new(
            workflow.config.clone(),
            &endpoint,
            &workflow.entry_point,
            options.findings,
            Some(context),
        );

        info!(workflow = %workflow_id, thread = %thread_id, endpoint = %endpoint, "Starting workflow execution");

        if let Some(cp) = &checkpointer {
            cp.record_transition(StateTransition::new(
                &checkpoint_id,
                workflow_id,
                &thread_id,
                None,
                &workflow.entry_point,
                "entry",
            ))
            .await?;
        }

        let mut steps = 0usize;
        let mut current = Some(workflow.entry_point.clone());

        while let Some(node_id) = current.take() {
            if steps >= workflow.config.max_steps {
                let msg = format!(
                    "step limit of {} exceeded before node '{}'",
                    workflow.config.max_steps, node_id
                );
                warn!(workflow = %workflow_id, thread = %thread_id, "{}", msg);
                state.errors.push(msg);
                break;
            }
            steps += 1;

            let Some(node) = workflow.node(&node_id) else {
                state.errors.push(format!("node '{}' is not declared", node_id));
                break;
            };

            emitter.emit(&node_id, EventKind::NodeEnter);
            state.current_node = node_id.clone();

            let t0 = Instant::now();
            let outcome = run_node(node, &mut state).await;
            let duration = elapsed_ms(t0);

            state.visited_nodes.push(node_id.clone());
            state.execution_path.push(node.label());
            state.current_node = node_id.clone();
            state.node_timings.insert(node_id.clone(), duration);

            emitter.emit(&node_id, EventKind::NodeExit);
            debug!(workflow = %workflow_id, node = %node_id, duration_ms = duration, "Node finished");

            match outcome {
                NodeOutcome::Continue => {}
                NodeOutcome::Suspended => {
                    info!(workflow = %workflow_id, node = %node_id, "Awaiting user input");
                    break;
                }
                NodeOutcome::Failed => break,
            }

            if workflow.outgoing(&node_id).is_empty() {
                break;
            }

            match workflow.next_edge(&node_id, &state) {
                Some(edge) => {
                    if let Some(cp) = &checkpointer {
                        cp.record_transition(
                            StateTransition::new(
                                &checkpoint_id,
                                workflow_id,
                                &thread_id,
                                Some(&node_id),
                                &edge.to,
                                "normal",
                            )
                            .with_duration(duration),
                        )
                        .await?;
                    }
                    current = Some(edge.to.clone());
                }
                None => {
                    debug!(workflow = %workflow_id, node = %node_id, "No outgoing edge matched, ending walk");
                }
            }
        }

        let success = state.errors.is_empty();

        let saved_checkpoint = match &checkpointer {
            Some(cp) => {
                let metadata = serde_json::json!({
                    "source": "execution",
                    "success": success,
                    "step_count": steps,
                });
                Some(
                    cp.save(&checkpoint_id, &thread_id, &state, Some(metadata))
                        .await?,
                )
            }
            None => None,
        };

        let execution_time_ms = elapsed_ms(started);
        info!(
            workflow = %workflow_id,
            thread = %thread_id,
            success,
            steps,
            execution_time_ms,
            "Workflow execution complete"
        );

        Ok(ExecutionResult {
            success,
            state,
            execution_time_ms,
            thread_id,
            checkpoint_id: saved_checkpoint,
        })
    }
}

/// Finding counters a handler set explicitly; those survive the built-in refresh.
#[derive(Default)]
struct PinnedSummary {
    finding_count: Option<usize>,
    has_blockers: Option<bool>,
    has_major: Option<bool>,
}

impl PinnedSummary {
    fn from_patch(patch: &StatePatch) -> Self {
        Self {
            finding_count: patch.finding_count,
            has_blockers: patch.has_blockers,
            has_major: patch.has_major,
        }
    }

    fn refresh(&self, state: &mut WorkflowState) {
        state.refresh_finding_summary();
        if let Some(count) = self.finding_count {
            state.finding_count = count;
        }
        if let Some(flag) = self.has_blockers {
            state.has_blockers = flag;
        }
        if let Some(flag) = self.has_major {
            state.has_major = flag;
        }
    }
}

/// Run a node's handler and then its built-in type behavior.
async fn run_node(node: &WorkflowNode, state: &mut WorkflowState) -> NodeOutcome {
    let mut handler_set_severity = false;
    let mut handler_set_prompt = false;
    let mut pinned = PinnedSummary::default();

    if let Some(handler) = &node.handler {
        let result = AssertUnwindSafe(handler.handle(state)).catch_unwind().await;
        let failure = match result {
            Ok(Ok(patch)) => {
                handler_set_severity = patch.severity.is_some();
                handler_set_prompt = patch.user_prompt.is_some();
                pinned = PinnedSummary::from_patch(&patch);
                state.apply(patch);
                None
            }
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(message) = failure {
            let err = EngineError::Handler {
                node: node.id.clone(),
                message,
            };
            warn!(node = %node.id, error = %err, "Node handler failed");
            state.errors.push(err.to_string());
            return NodeOutcome::Failed;
        }
    }

    match node.node_type {
        NodeType::Aggregation => {
            pinned.refresh(state);
            NodeOutcome::Continue
        }
        NodeType::Decision => {
            pinned.refresh(state);
            if !handler_set_severity {
                state.severity = state.severity.max(state.max_finding_severity());
            }
            NodeOutcome::Continue
        }
        NodeType::HumanInput => {
            state.awaiting_user_input = true;
            if !handler_set_prompt {
                state.user_prompt = Some(node.name.clone());
            }
            NodeOutcome::Suspended
        }
    }
}
