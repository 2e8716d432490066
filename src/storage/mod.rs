pub mod memory_store;
pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::types::WorkflowState;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store is closed")]
    Closed,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable snapshot of one run's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCheckpoint {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub thread_id: String,
    pub state: WorkflowState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl StateCheckpoint {
    pub fn new(checkpoint_id: &str, workflow_id: &str, thread_id: &str, state: WorkflowState) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_string(),
            workflow_id: workflow_id.to_string(),
            thread_id: thread_id.to_string(),
            state,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Lifecycle status of a session. Transitions are driven by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown session status '{}'", other))),
        }
    }
}

/// A logical run of a workflow on one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub session_id: String,
    pub workflow_id: String,
    pub thread_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded hop between nodes. `from_node = None` marks the entry hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Assigned by the store on insert.
    pub id: i64,
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub thread_id: String,
    pub from_node: Option<String>,
    pub to_node: String,
    pub transition_type: String,
    pub duration_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(
        checkpoint_id: &str,
        workflow_id: &str,
        thread_id: &str,
        from_node: Option<&str>,
        to_node: &str,
        transition_type: &str,
    ) -> Self {
        Self {
            id: 0,
            checkpoint_id: checkpoint_id.to_string(),
            workflow_id: workflow_id.to_string(),
            thread_id: thread_id.to_string(),
            from_node: from_node.map(str::to_string),
            to_node: to_node.to_string(),
            transition_type: transition_type.to_string(),
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Selects the newest checkpoint of a workflow, optionally per thread and before a cutoff.
#[derive(Debug, Clone, Default)]
pub struct RecoveryQuery {
    pub workflow_id: String,
    pub thread_id: Option<String>,
    /// Exclusive upper bound on the checkpoint timestamp.
    pub before: Option<DateTime<Utc>>,
}

impl RecoveryQuery {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            thread_id: None,
            before: None,
        }
    }

    pub fn thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    pub fn before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.before = Some(timestamp);
        self
    }

    pub fn matches(&self, checkpoint: &StateCheckpoint) -> bool {
        checkpoint.workflow_id == self.workflow_id
            && self
                .thread_id
                .as_ref()
                .is_none_or(|t| &checkpoint.thread_id == t)
            && self.before.is_none_or(|b| checkpoint.timestamp < b)
    }
}

/// Backend for checkpoints, sessions and transitions.
///
/// Implementations must be safe to share across tasks. Writes may be
/// serialized internally; reads may run concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or overwrite a checkpoint by id.
    async fn upsert_checkpoint(&self, checkpoint: &StateCheckpoint) -> StoreResult<()>;

    async fn get_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<StateCheckpoint>>;

    /// Newest checkpoint matching the query (ties broken by insertion order).
    async fn latest_checkpoint(&self, query: &RecoveryQuery) -> StoreResult<Option<StateCheckpoint>>;

    /// Checkpoints of a workflow, newest first.
    async fn list_checkpoints(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateCheckpoint>>;

    /// Delete the oldest checkpoints of a workflow so at most `keep` remain.
    /// Returns the evicted ids.
    async fn prune_checkpoints(&self, workflow_id: &str, keep: usize) -> StoreResult<Vec<String>>;

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> StoreResult<bool>;

    async fn insert_session(&self, session: &WorkflowSession) -> StoreResult<()>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<WorkflowSession>>;

    /// Sessions in creation order, optionally filtered.
    async fn list_sessions(
        &self,
        workflow_id: Option<&str>,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<WorkflowSession>>;

    async fn update_session_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<bool>;

    /// Point every active session of the scope at a new checkpoint.
    async fn link_checkpoint(
        &self,
        workflow_id: &str,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> StoreResult<u64>;

    /// Append a transition and return its assigned id.
    async fn append_transition(&self, transition: &StateTransition) -> StoreResult<i64>;

    /// Transitions ordered by ascending timestamp, then insertion order.
    async fn transition_history(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateTransition>>;

    /// Release the backend. Idempotent.
    async fn close(&self) -> StoreResult<()>;
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", us)))
}
