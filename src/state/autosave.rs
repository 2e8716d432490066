use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::types::WorkflowState;
use crate::state::Persistence;
use crate::storage::{StateCheckpoint, StoreError};

/// Supplies the state snapshot persisted on each auto-save tick.
pub type StateSupplier = Arc<dyn Fn() -> WorkflowState + Send + Sync>;

type Scope = (String, String);

/// Background timers that periodically checkpoint a caller-supplied state,
/// one per (workflow, thread) scope.
#[derive(Default)]
pub(crate) struct AutoSaveScheduler {
    timers: Mutex<HashMap<Scope, JoinHandle<()>>>,
}

impl AutoSaveScheduler {
    /// Start (or restart) the timer for a scope. Returns false without a Tokio runtime.
    pub(crate) fn start(
        &self,
        persistence: Arc<Persistence>,
        workflow_id: &str,
        thread_id: &str,
        period: Duration,
        get_state: StateSupplier,
    ) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(workflow = %workflow_id, thread = %thread_id, "Auto-save requires a Tokio runtime");
            return false;
        };

        let scope = (workflow_id.to_string(), thread_id.to_string());
        let (wf, thread) = scope.clone();

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let state = match std::panic::catch_unwind(AssertUnwindSafe(|| get_state())) {
                    Ok(state) => state,
                    Err(_) => {
                        warn!(workflow = %wf, thread = %thread, "Auto-save state supplier panicked, skipping tick");
                        continue;
                    }
                };
                let checkpoint = StateCheckpoint::new(
                    &format!("cp-{}", Uuid::new_v4()),
                    &wf,
                    &thread,
                    state,
                )
                .with_metadata(serde_json::json!({ "source": "auto_save" }));

                match persistence.save_checkpoint(&checkpoint).await {
                    Ok(()) => {
                        debug!(workflow = %wf, thread = %thread, checkpoint = %checkpoint.checkpoint_id, "Auto-saved state");
                    }
                    Err(StoreError::Closed) => {
                        debug!(workflow = %wf, thread = %thread, "State store closed, stopping auto-save");
                        break;
                    }
                    Err(e) => {
                        warn!(workflow = %wf, thread = %thread, error = %e, "Auto-save tick failed");
                    }
                }
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.insert(scope, handle) {
            previous.abort();
        }
        info!(workflow = %workflow_id, thread = %thread_id, period_ms = period.as_millis() as u64, "Auto-save enabled");
        true
    }

    /// Stop the timer for a scope. Returns whether one was running.
    pub(crate) fn stop(&self, workflow_id: &str, thread_id: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(workflow_id.to_string(), thread_id.to_string()));
        match removed {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                info!(workflow = %workflow_id, thread = %thread_id, "Auto-save disabled");
                true
            }
            _ => false,
        }
    }

    /// Stop every timer. Returns how many were running.
    pub(crate) fn stop_all(&self) -> usize {
        let drained: Vec<JoinHandle<()>> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in &drained {
            handle.abort();
        }
        drained.len()
    }

    /// Timers still running. Finished loops are dropped from the table.
    pub(crate) fn active(&self) -> usize {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.retain(|_, handle| !handle.is_finished());
        timers.len()
    }
}
