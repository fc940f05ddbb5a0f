//! Session scheduling: dispatch, retries, timeouts, cancellation

mod coordinator;
pub mod handle;
pub mod retry;
pub mod state;

use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::ResultAggregator;
use crate::config::OrchestrationConfig;
use crate::core::{Result, UsageTracker};
use crate::executor::TaskExecutor;
use crate::graph::TaskGraph;
use crate::model::{OrchestrationSession, SessionStatus};
use crate::stream::{EventStreamer, OrchestrationEvent};

use coordinator::{panic_message, Coordinator};
use handle::SessionContext;
pub use handle::SessionHandle;
pub use retry::RetryPolicy;
pub use state::SessionState;

/// Start orchestrating a validated graph
///
/// Returns as soon as the coordinator is spawned. Must be called from within
/// a Tokio runtime.
pub fn launch(
    request_id: impl Into<String>,
    graph: TaskGraph,
    config: Arc<OrchestrationConfig>,
    executor: Arc<dyn TaskExecutor>,
) -> Result<SessionHandle> {
    config.validate()?;
    let request_id = request_id.into();
    let session =
        OrchestrationSession::new(request_id.clone(), config.concurrency_limit, graph.len());
    let session_id = session.id;

    let aggregator = Arc::new(ResultAggregator::new(session_id, &config.conflicts)?);
    let streamer = Arc::new(EventStreamer::new(session_id, &config.stream));
    let state = SessionState::new(session, &graph);
    let ctx = Arc::new(SessionContext {
        id: session_id,
        state: RwLock::new(state),
        graph: Arc::new(graph),
        aggregator,
        streamer,
        usage: Arc::new(UsageTracker::new()),
        cancel: CancellationToken::new(),
    });

    info!(session_id = %session_id, request_id = %request_id, "Launching orchestration");
    let coordinator = Coordinator::new(ctx.clone(), executor, config);
    let supervised = ctx.clone();
    let join = tokio::spawn(async move {
        match AssertUnwindSafe(coordinator.run()).catch_unwind().await {
            Ok(status) => status,
            Err(panic) => fail_session(&supervised, &panic_message(panic.as_ref())),
        }
    });

    Ok(SessionHandle::new(ctx, request_id, join))
}

/// The coordinator itself could not proceed
fn fail_session(ctx: &SessionContext, reason: &str) -> SessionStatus {
    error!(session_id = %ctx.id, reason, "Coordinator panicked, failing orchestration");
    ctx.cancel.cancel();
    let session = {
        let mut state = ctx.state.write();
        state.finish(SessionStatus::Failed);
        state.session().clone()
    };
    ctx.streamer.publish(OrchestrationEvent::OrchestrationCompleted {
        status: SessionStatus::Failed,
        total_tasks: session.total_tasks,
        completed_tasks: session.completed_tasks,
        failed_tasks: session.failed_tasks,
        open_conflicts: ctx.aggregator.open_conflict_count(),
        usage: session.usage,
        duration_ms: session.total_duration_ms(),
    });
    SessionStatus::Failed
}
