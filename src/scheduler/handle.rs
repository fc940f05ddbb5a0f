use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::SessionState;
use crate::aggregate::{AggregatedFile, ResultAggregator};
use crate::conflict::{MergeConflict, ResolutionChoice};
use crate::core::{OrchestraError, Result, UsageTracker};
use crate::graph::{GraphSnapshot, TaskGraph};
use crate::model::{
    ConflictId, OrchestrationSession, OrchestrationTask, SessionId, SessionStatus,
};
use crate::stream::{EventStreamer, EventSubscription, OrchestrationEvent};

/// Everything one session's coordinator and its readers share
pub(crate) struct SessionContext {
    pub(crate) id: SessionId,
    pub(crate) state: RwLock<SessionState>,
    pub(crate) graph: Arc<TaskGraph>,
    pub(crate) aggregator: Arc<ResultAggregator>,
    pub(crate) streamer: Arc<EventStreamer>,
    pub(crate) usage: Arc<UsageTracker>,
    pub(crate) cancel: CancellationToken,
}

/// Read access and control for a running or finished orchestration
///
/// The coordinator is the only writer of task state; the handle sees
/// point-in-time copies.
pub struct SessionHandle {
    ctx: Arc<SessionContext>,
    request_id: String,
    join: Mutex<Option<JoinHandle<SessionStatus>>>,
}

impl SessionHandle {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        request_id: String,
        join: JoinHandle<SessionStatus>,
    ) -> Self {
        Self {
            ctx,
            request_id,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.ctx.id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> SessionStatus {
        self.ctx.state.read().status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn session(&self) -> OrchestrationSession {
        self.ctx.state.read().session().clone()
    }

    /// Task records in canonical order
    pub fn tasks(&self) -> Vec<OrchestrationTask> {
        self.ctx.state.read().tasks().cloned().collect()
    }

    pub fn task(&self, task_id: &str) -> Result<OrchestrationTask> {
        self.ctx
            .state
            .read()
            .task(task_id)
            .cloned()
            .ok_or_else(|| OrchestraError::TaskNotFound(task_id.to_string()))
    }

    pub fn graph(&self) -> GraphSnapshot {
        self.ctx.graph.snapshot()
    }

    pub fn conflicts(&self) -> Vec<MergeConflict> {
        self.ctx.aggregator.conflicts()
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Option<MergeConflict> {
        self.ctx.aggregator.conflict(conflict_id)
    }

    pub fn results(&self) -> Vec<AggregatedFile> {
        self.ctx.aggregator.snapshot()
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.ctx.usage
    }

    /// Events so far, then live events until the session completes
    pub fn subscribe(&self) -> EventSubscription {
        self.ctx.streamer.subscribe()
    }

    /// Request cooperative cancellation; returns false if already requested
    pub fn cancel(&self) -> bool {
        if self.ctx.cancel.is_cancelled() {
            return false;
        }
        info!(session_id = %self.ctx.id, "Cancelling orchestration");
        self.ctx.cancel.cancel();
        true
    }

    /// Resolve an open conflict and settle the session status if it was the last one
    pub fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        choice: ResolutionChoice,
        resolved_by: Option<String>,
    ) -> Result<MergeConflict> {
        let conflict = self.ctx.aggregator.resolve(conflict_id, choice, resolved_by)?;
        if conflict.is_open() {
            return Ok(conflict);
        }
        self.ctx
            .streamer
            .publish(OrchestrationEvent::conflict_resolved(&conflict));

        let mut state = self.ctx.state.write();
        if !self.ctx.aggregator.has_open_conflicts() && state.settle_conflicts() {
            info!(session_id = %self.ctx.id, "Last conflict resolved, orchestration completed");
        }
        Ok(conflict)
    }

    /// Wait for the coordinator to finish and return the session status
    pub async fn wait(&self) -> SessionStatus {
        let mut join = self.join.lock().await;
        if let Some(handle) = join.take() {
            if let Err(err) = handle.await {
                warn!(
                    session_id = %self.ctx.id,
                    error = %err,
                    "Coordinator task did not finish cleanly"
                );
            }
        }
        // may have settled from CompletedWithConflicts since
        self.status()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.ctx.id)
            .field("request_id", &self.request_id)
            .field("status", &self.status())
            .finish()
    }
}
