use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::storage::*;

struct StoredCheckpoint {
    seq: u64,
    checkpoint: StateCheckpoint,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    next_seq: u64,
    next_transition_id: i64,
    checkpoints: HashMap<String, StoredCheckpoint>,
    sessions: Vec<WorkflowSession>,
    transitions: Vec<StateTransition>,
}

/// In-process state store. Holds everything for the lifetime of the instance.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))?;
        if guard.closed {
            return Err(StoreError::Closed);
        }
        Ok(guard)
    }
}

/// Checkpoints of a workflow sorted oldest first.
fn sorted_for<'a>(inner: &'a Inner, workflow_id: &str) -> Vec<&'a StoredCheckpoint> {
    let mut entries: Vec<&StoredCheckpoint> = inner
        .checkpoints
        .values()
        .filter(|s| s.checkpoint.workflow_id == workflow_id)
        .collect();
    entries.sort_by_key(|s| (s.checkpoint.timestamp, s.seq));
    entries
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn upsert_checkpoint(&self, checkpoint: &StateCheckpoint) -> StoreResult<()> {
        let mut inner = self.lock()?;

        // Mirror the durable backends: the live context never survives a save.
        let mut stored = checkpoint.clone();
        stored.state.context = None;

        let existing = inner
            .checkpoints
            .get(&checkpoint.checkpoint_id)
            .map(|s| s.seq);
        let seq = match existing {
            Some(seq) => seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.checkpoints.insert(
            checkpoint.checkpoint_id.clone(),
            StoredCheckpoint {
                seq,
                checkpoint: stored,
            },
        );
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<StateCheckpoint>> {
        let inner = self.lock()?;
        Ok(inner
            .checkpoints
            .get(checkpoint_id)
            .map(|s| s.checkpoint.clone()))
    }

    async fn latest_checkpoint(&self, query: &RecoveryQuery) -> StoreResult<Option<StateCheckpoint>> {
        let inner = self.lock()?;
        Ok(inner
            .checkpoints
            .values()
            .filter(|s| query.matches(&s.checkpoint))
            .max_by_key(|s| (s.checkpoint.timestamp, s.seq))
            .map(|s| s.checkpoint.clone()))
    }

    async fn list_checkpoints(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateCheckpoint>> {
        let inner = self.lock()?;
        Ok(sorted_for(&inner, workflow_id)
            .into_iter()
            .rev()
            .filter(|s| thread_id.is_none_or(|t| s.checkpoint.thread_id == t))
            .map(|s| s.checkpoint.clone())
            .collect())
    }

    async fn prune_checkpoints(&self, workflow_id: &str, keep: usize) -> StoreResult<Vec<String>> {
        let mut inner = self.lock()?;
        let ordered = sorted_for(&inner, workflow_id);
        let excess = ordered.len().saturating_sub(keep);
        let evicted: Vec<String> = ordered
            .into_iter()
            .take(excess)
            .map(|s| s.checkpoint.checkpoint_id.clone())
            .collect();
        for id in &evicted {
            inner.checkpoints.remove(id);
        }
        Ok(evicted)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner.checkpoints.remove(checkpoint_id).is_some())
    }

    async fn insert_session(&self, session: &WorkflowSession) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if inner
            .sessions
            .iter()
            .any(|s| s.session_id == session.session_id)
        {
            return Err(StoreError::Corrupt(format!(
                "session '{}' already exists",
                session.session_id
            )));
        }
        inner.sessions.push(session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<WorkflowSession>> {
        let inner = self.lock()?;
        Ok(inner
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    async fn list_sessions(
        &self,
        workflow_id: Option<&str>,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<WorkflowSession>> {
        let inner = self.lock()?;
        Ok(inner
            .sessions
            .iter()
            .filter(|s| workflow_id.is_none_or(|w| s.workflow_id == w))
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect())
    }

    async fn update_session_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.sessions.iter_mut().find(|s| s.session_id == session_id) {
            Some(session) => {
                session.status = status;
                session.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn link_checkpoint(
        &self,
        workflow_id: &str,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut updated = 0;
        for session in inner.sessions.iter_mut().filter(|s| {
            s.workflow_id == workflow_id
                && s.thread_id == thread_id
                && s.status == SessionStatus::Active
        }) {
            session.last_checkpoint_id = Some(checkpoint_id.to_string());
            session.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn append_transition(&self, transition: &StateTransition) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        inner.next_transition_id += 1;
        let id = inner.next_transition_id;
        let mut stored = transition.clone();
        stored.id = id;
        inner.transitions.push(stored);
        Ok(id)
    }

    async fn transition_history(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateTransition>> {
        let inner = self.lock()?;
        let mut history: Vec<StateTransition> = inner
            .transitions
            .iter()
            .filter(|t| t.workflow_id == workflow_id)
            .filter(|t| thread_id.is_none_or(|th| t.thread_id == th))
            .cloned()
            .collect();
        history.sort_by_key(|t| (t.timestamp, t.id));
        Ok(history)
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))?;
        inner.closed = true;
        inner.checkpoints.clear();
        inner.sessions.clear();
        inner.transitions.clear();
        Ok(())
    }
}
