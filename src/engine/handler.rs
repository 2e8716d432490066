use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{StatePatch, WorkflowState};

/// Business logic attached to a workflow node.
///
/// A handler reads the current state and returns a patch to merge into it.
/// Returning `Err` records the message in `state.errors` and stops the walk.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(&self, state: &WorkflowState) -> Result<StatePatch>;
}

/// Adapter turning an async closure into a [`NodeHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StatePatch>> + Send + 'static,
{
    async fn handle(&self, state: &WorkflowState) -> Result<StatePatch> {
        (self.0)(state.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// let h = handler_fn(|state| async move {
///     Ok(StatePatch::new().value("seen", serde_json::json!(state.findings.len())))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StatePatch>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
