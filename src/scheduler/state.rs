use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

use crate::core::ResourceUsage;
use crate::graph::TaskGraph;
use crate::model::{OrchestrationSession, OrchestrationTask, SessionStatus, TaskId, TaskStatus};

/// Task and session records for one orchestration
///
/// Readers get clones through `SessionHandle`. Mutation is restricted to the
/// scheduler module.
#[derive(Debug, Clone)]
pub struct SessionState {
    session: OrchestrationSession,
    tasks: HashMap<TaskId, OrchestrationTask>,
    // canonical order
    order: Vec<TaskId>,
}

impl SessionState {
    pub(super) fn new(session: OrchestrationSession, graph: &TaskGraph) -> Self {
        let tasks = graph
            .nodes()
            .map(|node| {
                let task = OrchestrationTask::from_descriptor(
                    session.id,
                    &node.descriptor,
                    node.dependencies.clone(),
                );
                (node.id.clone(), task)
            })
            .collect();
        Self {
            session,
            tasks,
            order: graph.order().to_vec(),
        }
    }

    pub fn session(&self) -> &OrchestrationSession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn task(&self, id: &str) -> Option<&OrchestrationTask> {
        self.tasks.get(id)
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Tasks in canonical order
    pub fn tasks(&self) -> impl Iterator<Item = &OrchestrationTask> {
        self.order.iter().filter_map(move |id| self.tasks.get(id))
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Ids in canonical order matching `status`
    pub(super) fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.task_status(id) == Some(status))
            .cloned()
            .collect()
    }

    pub(super) fn start(&mut self) {
        self.session.started_at = Some(Utc::now());
        self.session.status = SessionStatus::Running;
    }

    fn transition(&mut self, id: &str, status: TaskStatus) -> Option<&mut OrchestrationTask> {
        let task = self.tasks.get_mut(id)?;
        // terminal states are final
        if task.status.is_terminal() {
            return None;
        }
        debug!(task_id = %id, from = ?task.status, to = ?status, "Task transition");
        task.status = status;
        if status.is_terminal() {
            let now = Utc::now();
            task.completed_at = Some(now);
            if let Some(started) = task.started_at {
                task.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
        }
        Some(task)
    }

    pub(super) fn mark_ready(&mut self, id: &str) {
        self.transition(id, TaskStatus::Ready);
    }

    pub(super) fn mark_running(&mut self, id: &str) -> Option<OrchestrationTask> {
        let task = self.transition(id, TaskStatus::Running)?;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    pub(super) fn mark_completed(
        &mut self,
        id: &str,
        attempts: u32,
        output_paths: Vec<String>,
        usage: ResourceUsage,
    ) -> Option<OrchestrationTask> {
        let task = self.transition(id, TaskStatus::Completed)?;
        task.attempts = attempts;
        task.output_paths = output_paths;
        task.usage = usage;
        let task = task.clone();
        self.session.completed_tasks += 1;
        self.session.usage += usage;
        Some(task)
    }

    /// Failed or TimedOut
    pub(super) fn mark_failed(
        &mut self,
        id: &str,
        status: TaskStatus,
        attempts: u32,
        error: String,
    ) -> Option<OrchestrationTask> {
        let task = self.transition(id, status)?;
        task.attempts = attempts;
        task.error = Some(error);
        let task = task.clone();
        self.session.failed_tasks += 1;
        Some(task)
    }

    pub(super) fn mark_blocked(&mut self, id: &str, reason: String) -> bool {
        match self.transition(id, TaskStatus::Blocked) {
            Some(task) => {
                task.status_reason = Some(reason);
                true
            }
            None => false,
        }
    }

    pub(super) fn mark_cancelled(&mut self, id: &str, attempts: Option<u32>, reason: &str) -> bool {
        match self.transition(id, TaskStatus::Cancelled) {
            Some(task) => {
                if let Some(attempts) = attempts {
                    task.attempts = attempts;
                }
                task.status_reason = Some(reason.to_string());
                true
            }
            None => false,
        }
    }

    pub(super) fn finish(&mut self, status: SessionStatus) {
        self.session.status = status;
        self.session.completed_at = Some(Utc::now());
    }

    /// CompletedWithConflicts becomes Completed once no conflict is open
    pub(super) fn settle_conflicts(&mut self) -> bool {
        if self.session.status == SessionStatus::CompletedWithConflicts {
            self.session.status = SessionStatus::Completed;
            return true;
        }
        false
    }
}
