pub mod autosave;
pub mod checkpointer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::types::WorkflowState;
use crate::state::autosave::{AutoSaveScheduler, StateSupplier};
use crate::state::checkpointer::MemorySaver;
use crate::storage::sqlite_store::{MEMORY_PATH, SqliteStateStore};
use crate::storage::{
    RecoveryQuery, SessionStatus, StateCheckpoint, StateStore, StateTransition, StoreError,
    StoreResult, WorkflowSession, from_micros, to_micros,
};

pub const DEFAULT_MAX_CHECKPOINTS: usize = 100;
pub const DEFAULT_AUTO_SAVE_INTERVAL_MS: u64 = 30_000;

/// Construction options for [`StateManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateManagerConfig {
    pub db_path: String,
    pub enable_auto_save: bool,
    /// Checkpoints retained per workflow; 0 disables pruning.
    pub max_checkpoints: usize,
    pub auto_save_interval_ms: Option<u64>,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            db_path: MEMORY_PATH.to_string(),
            enable_auto_save: false,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            auto_save_interval_ms: None,
        }
    }
}

impl StateManagerConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(
            self.auto_save_interval_ms
                .unwrap_or(DEFAULT_AUTO_SAVE_INTERVAL_MS)
                .max(1),
        )
    }
}

/// Checkpoint write path shared by the manager and its auto-save timers.
pub(crate) struct Persistence {
    store: Arc<dyn StateStore>,
    max_checkpoints: usize,
    closed: AtomicBool,
    last_transition_us: AtomicI64,
}

impl Persistence {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Upsert, link active sessions, then enforce retention for the workflow.
    pub(crate) async fn save_checkpoint(&self, checkpoint: &StateCheckpoint) -> StoreResult<()> {
        self.ensure_open()?;
        self.store.upsert_checkpoint(checkpoint).await?;
        self.store
            .link_checkpoint(
                &checkpoint.workflow_id,
                &checkpoint.thread_id,
                &checkpoint.checkpoint_id,
            )
            .await?;

        if self.max_checkpoints > 0 {
            let evicted = self
                .store
                .prune_checkpoints(&checkpoint.workflow_id, self.max_checkpoints)
                .await?;
            if !evicted.is_empty() {
                debug!(workflow = %checkpoint.workflow_id, evicted = ?evicted, "Checkpoint retention applied");
            }
        }
        Ok(())
    }

    /// Wall-clock microseconds, bumped so successive calls strictly increase.
    fn next_transition_micros(&self) -> i64 {
        let now = to_micros(Utc::now());
        let previous = self
            .last_transition_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

/// Façade over checkpoints, sessions, transitions and auto-save.
///
/// The only component that talks to the storage backend. Safe to share
/// across concurrent workflow executions.
pub struct StateManager {
    config: StateManagerConfig,
    persistence: Arc<Persistence>,
    savers: Mutex<HashMap<String, Arc<MemorySaver>>>,
    auto_save: AutoSaveScheduler,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StateManager {
    /// Open a SQLite-backed manager at `config.db_path`.
    pub async fn open(config: StateManagerConfig) -> StoreResult<Self> {
        let store = SqliteStateStore::open(&config.db_path).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Build a manager over an existing backend.
    pub fn with_store(config: StateManagerConfig, store: Arc<dyn StateStore>) -> Self {
        let persistence = Arc::new(Persistence {
            store,
            max_checkpoints: config.max_checkpoints,
            closed: AtomicBool::new(false),
            last_transition_us: AtomicI64::new(0),
        });
        Self {
            config,
            persistence,
            savers: Mutex::new(HashMap::new()),
            auto_save: AutoSaveScheduler::default(),
        }
    }

    pub fn config(&self) -> &StateManagerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.persistence.closed.load(Ordering::Acquire)
    }

    fn store(&self) -> StoreResult<&Arc<dyn StateStore>> {
        self.persistence.ensure_open()?;
        Ok(&self.persistence.store)
    }

    // --- Checkpoints ---

    /// Upsert a checkpoint by id and apply retention for its workflow.
    pub async fn save_checkpoint(&self, checkpoint: &StateCheckpoint) -> StoreResult<()> {
        self.persistence.save_checkpoint(checkpoint).await
    }

    pub async fn load_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<StateCheckpoint>> {
        self.store()?.get_checkpoint(checkpoint_id).await
    }

    /// Newest checkpoint for the workflow (and thread), strictly older than
    /// `query.before` when given.
    pub async fn recover_state(&self, query: &RecoveryQuery) -> StoreResult<Option<StateCheckpoint>> {
        self.store()?.latest_checkpoint(query).await
    }

    /// Checkpoints for a workflow, newest first.
    pub async fn list_checkpoints(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateCheckpoint>> {
        self.store()?.list_checkpoints(workflow_id, thread_id).await
    }

    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> StoreResult<bool> {
        self.store()?.delete_checkpoint(checkpoint_id).await
    }

    // --- Sessions ---

    /// Register an active session and return its generated id.
    pub async fn create_session(
        &self,
        workflow_id: &str,
        thread_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<String> {
        let now = Utc::now();
        let session = WorkflowSession {
            session_id: format!("session-{}", Uuid::new_v4()),
            workflow_id: workflow_id.to_string(),
            thread_id: thread_id.to_string(),
            status: SessionStatus::Active,
            last_checkpoint_id: None,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.store()?.insert_session(&session).await?;
        info!(workflow = %workflow_id, thread = %thread_id, session = %session.session_id, "Session created");
        Ok(session.session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> StoreResult<Option<WorkflowSession>> {
        self.store()?.get_session(session_id).await
    }

    pub async fn list_sessions(
        &self,
        workflow_id: &str,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<WorkflowSession>> {
        self.store()?.list_sessions(Some(workflow_id), status).await
    }

    /// Sessions across every workflow.
    pub async fn list_all_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<WorkflowSession>> {
        self.store()?.list_sessions(None, status).await
    }

    /// Returns false when no such session exists.
    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> StoreResult<bool> {
        let updated = self
            .store()?
            .update_session_status(session_id, status)
            .await?;
        if updated {
            info!(session = %session_id, status = %status, "Session status updated");
        }
        Ok(updated)
    }

    // --- Transitions ---

    /// Append a transition. The timestamp is reassigned so that inserts
    /// through this manager are strictly increasing.
    pub async fn record_transition(&self, mut transition: StateTransition) -> StoreResult<i64> {
        let store = self.store()?;
        transition.timestamp = from_micros(self.persistence.next_transition_micros())?;
        store.append_transition(&transition).await
    }

    pub async fn get_transition_history(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateTransition>> {
        self.store()?.transition_history(workflow_id, thread_id).await
    }

    // --- Memory savers ---

    /// The per-workflow in-memory saver, created on first use.
    pub fn get_memory_saver(&self, workflow_id: &str) -> Arc<MemorySaver> {
        self.savers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(MemorySaver::new(workflow_id)))
            .clone()
    }

    // --- Auto-save ---

    /// Periodically checkpoint `get_state()` for the scope. A no-op unless
    /// auto-save was enabled in the config. Returns whether a timer started.
    pub fn enable_auto_save<F>(&self, workflow_id: &str, thread_id: &str, get_state: F) -> bool
    where
        F: Fn() -> WorkflowState + Send + Sync + 'static,
    {
        if !self.config.enable_auto_save {
            debug!(workflow = %workflow_id, thread = %thread_id, "Auto-save disabled by config");
            return false;
        }
        if self.is_closed() {
            return false;
        }
        let supplier: StateSupplier = Arc::new(get_state);
        self.auto_save.start(
            self.persistence.clone(),
            workflow_id,
            thread_id,
            self.config.auto_save_interval(),
            supplier,
        )
    }

    /// Stop the scope's timer. Returns whether one was running.
    pub fn disable_auto_save(&self, workflow_id: &str, thread_id: &str) -> bool {
        self.auto_save.stop(workflow_id, thread_id)
    }

    pub fn active_auto_saves(&self) -> usize {
        self.auto_save.active()
    }

    // --- Lifecycle ---

    /// Cancel all timers and release the backend. Safe to call repeatedly.
    pub async fn close(&self) -> StoreResult<()> {
        if self.persistence.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let stopped = self.auto_save.stop_all();
        self.persistence.store.close().await?;
        info!(timers_stopped = stopped, "State manager closed");
        Ok(())
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        self.auto_save.stop_all();
    }
}
