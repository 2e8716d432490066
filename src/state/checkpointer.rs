use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::engine::types::WorkflowState;
use crate::state::StateManager;
use crate::storage::{RecoveryQuery, StateCheckpoint, StateTransition, StoreResult};

/// Per-workflow in-memory cache of the latest checkpoint of each thread.
#[derive(Debug)]
pub struct MemorySaver {
    workflow_id: String,
    threads: RwLock<HashMap<String, StateCheckpoint>>,
}

impl MemorySaver {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            threads: RwLock::new(HashMap::new()),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Keep `checkpoint` if it is at least as new as the one already held for its thread.
    pub fn put(&self, checkpoint: StateCheckpoint) {
        let mut threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        let newer = threads
            .get(&checkpoint.thread_id)
            .is_none_or(|held| held.timestamp <= checkpoint.timestamp);
        if newer {
            threads.insert(checkpoint.thread_id.clone(), checkpoint);
        }
    }

    pub fn get(&self, thread_id: &str) -> Option<StateCheckpoint> {
        self.threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned()
    }

    /// Held checkpoints, newest first.
    pub fn list(&self) -> Vec<StateCheckpoint> {
        let mut all: Vec<StateCheckpoint> = self
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all
    }

    pub fn len(&self) -> usize {
        self.threads.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Persistence handle bound to a compiled workflow with checkpointing enabled.
///
/// Saves go to the durable store first and are then mirrored into the
/// workflow's [`MemorySaver`].
#[derive(Debug)]
pub struct Checkpointer {
    workflow_id: String,
    manager: Arc<StateManager>,
    memory: Arc<MemorySaver>,
}

impl Checkpointer {
    pub fn new(manager: Arc<StateManager>, workflow_id: &str) -> Self {
        let memory = manager.get_memory_saver(workflow_id);
        Self {
            workflow_id: workflow_id.to_string(),
            manager,
            memory,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn memory(&self) -> &Arc<MemorySaver> {
        &self.memory
    }

    pub fn manager(&self) -> &Arc<StateManager> {
        &self.manager
    }

    /// Persist `state` under `checkpoint_id` for `thread_id`.
    pub async fn save(
        &self,
        checkpoint_id: &str,
        thread_id: &str,
        state: &WorkflowState,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<String> {
        let mut checkpoint =
            StateCheckpoint::new(checkpoint_id, &self.workflow_id, thread_id, state.clone());
        checkpoint.state.context = None;
        checkpoint.metadata = metadata;

        self.manager.save_checkpoint(&checkpoint).await?;
        self.memory.put(checkpoint);

        debug!(workflow = %self.workflow_id, thread = %thread_id, checkpoint = %checkpoint_id, "Checkpoint saved");
        Ok(checkpoint_id.to_string())
    }

    /// Latest checkpoint of a thread, served from memory when available.
    pub async fn latest(&self, thread_id: &str) -> StoreResult<Option<StateCheckpoint>> {
        if let Some(cp) = self.memory.get(thread_id) {
            return Ok(Some(cp));
        }
        let recovered = self
            .manager
            .recover_state(&RecoveryQuery::new(&self.workflow_id).thread(thread_id))
            .await?;
        if let Some(ref cp) = recovered {
            self.memory.put(cp.clone());
        }
        Ok(recovered)
    }

    pub async fn record_transition(&self, transition: StateTransition) -> StoreResult<i64> {
        self.manager.record_transition(transition).await
    }
}
