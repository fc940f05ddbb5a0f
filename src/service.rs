//! In-process facade over orchestration sessions
//!
//! Each method maps one-to-one onto an HTTP operation and returns a serde DTO,
//! so a transport layer only has to route and serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::ContentKind;
use crate::config::OrchestrationConfig;
use crate::conflict::{ConflictType, MergeConflict, ResolutionChoice, Severity};
use crate::core::{OrchestraError, ResourceUsage, Result};
use crate::executor::TaskExecutor;
use crate::graph::{GraphSnapshot, TaskGraph};
use crate::model::{
    ConflictId, OrchestrationTask, SessionId, SessionStatus, TaskId, TaskPlan, TaskStatus,
    TaskType,
};
use crate::scheduler::{self, SessionHandle};
use crate::stream::EventSubscription;

/// Produces the task batch for an originating request
#[async_trait]
pub trait TaskPlanner: Send + Sync + 'static {
    async fn plan(&self, request_id: &str) -> anyhow::Result<TaskPlan>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub orchestration_id: SessionId,
    pub request_id: String,
    pub total_tasks: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub orchestration_id: SessionId,
    pub request_id: String,
    pub status: SessionStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub running_tasks: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<i64>,
    pub usage: ResourceUsage,
    pub dependency_graph: GraphSnapshot,
    pub has_conflicts: bool,
    pub open_conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: TaskType,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub usage: ResourceUsage,
    pub output_paths: Vec<String>,
    pub has_output: bool,
    pub error: Option<String>,
    pub status_reason: Option<String>,
}

impl From<OrchestrationTask> for TaskView {
    fn from(task: OrchestrationTask) -> Self {
        Self {
            has_output: !task.output_paths.is_empty(),
            id: task.id,
            task_type: task.task_type,
            name: task.name,
            description: task.description,
            status: task.status,
            dependencies: task.dependencies,
            attempts: task.attempts,
            started_at: task.started_at,
            completed_at: task.completed_at,
            duration_ms: task.duration_ms,
            usage: task.usage,
            output_paths: task.output_paths,
            error: task.error,
            status_reason: task.status_reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub orchestration_id: SessionId,
    /// False when cancellation had already been requested or the session was done
    pub cancel_requested: bool,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictListView {
    pub orchestration_id: SessionId,
    pub conflict_count: usize,
    pub open_count: usize,
    pub conflicts: Vec<MergeConflict>,
}

/// Body of a resolve call; exactly one strategy must be given
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default)]
    pub auto_resolve: bool,
    #[serde(default)]
    pub winning_task_id: Option<TaskId>,
    #[serde(default)]
    pub merged_content: Option<String>,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

impl ResolveRequest {
    pub fn auto() -> Self {
        Self {
            auto_resolve: true,
            ..Default::default()
        }
    }

    pub fn winner(task_id: impl Into<TaskId>) -> Self {
        Self {
            winning_task_id: Some(task_id.into()),
            ..Default::default()
        }
    }

    pub fn merged(content: impl Into<String>) -> Self {
        Self {
            merged_content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn by(mut self, resolved_by: impl Into<String>) -> Self {
        self.resolved_by = Some(resolved_by.into());
        self
    }

    pub fn choice(&self) -> Result<ResolutionChoice> {
        match (
            self.auto_resolve,
            &self.winning_task_id,
            &self.merged_content,
        ) {
            (true, None, None) => Ok(ResolutionChoice::Auto),
            (false, Some(task_id), None) => Ok(ResolutionChoice::WinningTask(task_id.clone())),
            (false, None, Some(content)) => Ok(ResolutionChoice::MergedContent(content.clone())),
            (false, None, None) => Err(OrchestraError::InvalidRequest(
                "one of autoResolve, winningTaskId or mergedContent is required".into(),
            )),
            _ => Err(OrchestraError::InvalidRequest(
                "autoResolve, winningTaskId and mergedContent are mutually exclusive".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFileView {
    pub path: String,
    pub language: ContentKind,
    pub contributors: Vec<TaskId>,
    pub content_length: usize,
    pub deleted: bool,
    pub has_open_conflict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub id: ConflictId,
    pub file_path: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsView {
    pub orchestration_id: SessionId,
    pub status: SessionStatus,
    pub file_count: usize,
    pub conflict_count: usize,
    pub files: Vec<ResultFileView>,
    pub conflicts: Vec<ConflictSummary>,
}

/// Owns every session started through it
pub struct OrchestrationService {
    config: Arc<OrchestrationConfig>,
    executor: Arc<dyn TaskExecutor>,
    planner: Option<Arc<dyn TaskPlanner>>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    by_request: DashMap<String, SessionId>,
}

impl OrchestrationService {
    pub fn new(config: OrchestrationConfig, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            executor,
            planner: None,
            sessions: DashMap::new(),
            by_request: DashMap::new(),
        })
    }

    pub fn with_planner(mut self, planner: Arc<dyn TaskPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Plan the request through the configured planner, then start it
    #[instrument(skip(self))]
    pub async fn start(&self, request_id: &str) -> Result<StartResponse> {
        // reject before planning if a session is already running
        if let Some(active) = self.active_session(request_id) {
            return Err(OrchestraError::AlreadyRunning {
                request_id: request_id.to_string(),
                session_id: active,
            });
        }
        let planner = self.planner.as_ref().ok_or_else(|| OrchestraError::Planning {
            request_id: request_id.to_string(),
            message: "no task planner configured".into(),
        })?;
        let plan = planner
            .plan(request_id)
            .await
            .map_err(|err| OrchestraError::Planning {
                request_id: request_id.to_string(),
                message: format!("{:#}", err),
            })?;
        self.start_with_plan(request_id, plan)
    }

    /// Validate and start a batch; fails without side effects on a bad graph
    pub fn start_with_plan(&self, request_id: &str, plan: TaskPlan) -> Result<StartResponse> {
        let graph = TaskGraph::from_descriptors(plan.tasks)?;

        let handle = match self.by_request.entry(request_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                if self
                    .sessions
                    .get(&existing)
                    .map_or(false, |s| !s.is_terminal())
                {
                    warn!(request_id, session_id = %existing, "Orchestration already running");
                    return Err(OrchestraError::AlreadyRunning {
                        request_id: request_id.to_string(),
                        session_id: existing,
                    });
                }
                let handle = self.launch(request_id, graph)?;
                occupied.insert(handle.id());
                handle
            }
            Entry::Vacant(vacant) => {
                let handle = self.launch(request_id, graph)?;
                vacant.insert(handle.id());
                handle
            }
        };

        let session = handle.session();
        info!(
            request_id,
            session_id = %session.id,
            tasks = session.total_tasks,
            "Orchestration accepted"
        );
        Ok(StartResponse {
            orchestration_id: session.id,
            request_id: session.request_id,
            total_tasks: session.total_tasks,
            status: session.status,
            created_at: session.created_at,
        })
    }

    fn launch(&self, request_id: &str, graph: TaskGraph) -> Result<Arc<SessionHandle>> {
        let handle = Arc::new(scheduler::launch(
            request_id,
            graph,
            self.config.clone(),
            self.executor.clone(),
        )?);
        self.sessions.insert(handle.id(), handle.clone());
        Ok(handle)
    }

    fn active_session(&self, request_id: &str) -> Option<SessionId> {
        let id = *self.by_request.get(request_id)?;
        let handle = self.sessions.get(&id)?;
        (!handle.is_terminal()).then_some(id)
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or(OrchestraError::SessionNotFound(id))
    }

    /// Most recent session started for a request
    pub fn latest_for_request(&self, request_id: &str) -> Option<SessionId> {
        self.by_request.get(request_id).map(|id| *id)
    }

    pub fn status(&self, id: SessionId) -> Result<SessionStatusView> {
        let handle = self.session(id)?;
        let session = handle.session();
        let open_conflicts = handle.conflicts().iter().filter(|c| c.is_open()).count();
        let running_tasks = handle
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        Ok(SessionStatusView {
            orchestration_id: session.id,
            total_duration_ms: session.total_duration_ms(),
            request_id: session.request_id,
            status: session.status,
            total_tasks: session.total_tasks,
            completed_tasks: session.completed_tasks,
            failed_tasks: session.failed_tasks,
            running_tasks,
            created_at: session.created_at,
            started_at: session.started_at,
            completed_at: session.completed_at,
            usage: session.usage,
            dependency_graph: handle.graph(),
            has_conflicts: open_conflicts > 0,
            open_conflicts,
        })
    }

    pub fn tasks(&self, id: SessionId) -> Result<Vec<TaskView>> {
        Ok(self
            .session(id)?
            .tasks()
            .into_iter()
            .map(TaskView::from)
            .collect())
    }

    pub fn cancel(&self, id: SessionId) -> Result<CancelAck> {
        let handle = self.session(id)?;
        let cancel_requested = !handle.is_terminal() && handle.cancel();
        Ok(CancelAck {
            orchestration_id: id,
            cancel_requested,
            status: handle.status(),
        })
    }

    pub fn conflicts(&self, id: SessionId) -> Result<ConflictListView> {
        let conflicts = self.session(id)?.conflicts();
        Ok(ConflictListView {
            orchestration_id: id,
            conflict_count: conflicts.len(),
            open_count: conflicts.iter().filter(|c| c.is_open()).count(),
            conflicts,
        })
    }

    /// Resolve a conflict from any session owned by this service
    #[instrument(skip(self, request), fields(conflict_id = %conflict_id))]
    pub fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        request: ResolveRequest,
    ) -> Result<MergeConflict> {
        let choice = request.choice()?;
        let handle = self
            .sessions
            .iter()
            .find(|entry| entry.value().conflict(conflict_id).is_some())
            .map(|entry| entry.value().clone())
            .ok_or(OrchestraError::ConflictNotFound(conflict_id))?;
        handle.resolve_conflict(conflict_id, choice, request.resolved_by)
    }

    pub fn results(&self, id: SessionId) -> Result<ResultsView> {
        let handle = self.session(id)?;
        let conflicts = handle.conflicts();
        let files: Vec<ResultFileView> = handle
            .results()
            .into_iter()
            .map(|file| ResultFileView {
                has_open_conflict: conflicts.iter().any(|c| c.is_open() && c.path == file.path),
                content_length: file.content_length(),
                deleted: file.is_deleted(),
                path: file.path,
                language: file.kind,
                contributors: file.contributors,
            })
            .collect();
        let conflicts: Vec<ConflictSummary> = conflicts
            .into_iter()
            .map(|c| ConflictSummary {
                open: c.is_open(),
                id: c.id,
                file_path: c.path,
                conflict_type: c.conflict_type,
                severity: c.severity,
            })
            .collect();
        Ok(ResultsView {
            orchestration_id: id,
            status: handle.status(),
            file_count: files.len(),
            conflict_count: conflicts.len(),
            files,
            conflicts,
        })
    }

    pub fn stream(&self, id: SessionId) -> Result<EventSubscription> {
        Ok(self.session(id)?.subscribe())
    }

    pub async fn wait(&self, id: SessionId) -> Result<SessionStatus> {
        Ok(self.session(id)?.wait().await)
    }

    /// Forget a finished session; a running one is refused with `AlreadyRunning`
    ///
    /// Sessions are kept until removed, including ones with open conflicts.
    pub fn remove(&self, id: SessionId) -> Result<Arc<SessionHandle>> {
        let handle = self.session(id)?;
        if !handle.is_terminal() {
            return Err(OrchestraError::AlreadyRunning {
                request_id: handle.request_id().to_string(),
                session_id: id,
            });
        }
        self.sessions.remove(&id);
        self.by_request
            .remove_if(handle.request_id(), |_, latest| *latest == id);
        debug!(session_id = %id, "Session removed");
        Ok(handle)
    }

    /// Remove every finished session, returning how many were dropped
    pub fn prune_finished(&self) -> usize {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_terminal())
            .map(|entry| *entry.key())
            .collect();
        finished
            .into_iter()
            .filter(|id| self.remove(*id).is_ok())
            .count()
    }
}
