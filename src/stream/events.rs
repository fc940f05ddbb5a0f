//! Typed orchestration events and their envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictType, MergeConflict, Resolution, Severity};
use crate::core::ResourceUsage;
use crate::model::{ConflictId, SessionId, SessionStatus, TaskId, TaskStatus, TaskType};

pub const EVENT_VERSION: u32 = 1;

/// The six observable transitions of a session
///
/// Conflicts raised while merging a task's output are published before that
/// task's `TaskCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum OrchestrationEvent {
    TaskStarted {
        task_id: TaskId,
        task_type: TaskType,
        name: String,
    },
    TaskCompleted {
        task_id: TaskId,
        duration_ms: u64,
        attempts: u32,
        output_paths: Vec<String>,
        usage: ResourceUsage,
        /// Finished after the session was cancelled
        late: bool,
    },
    /// Failed or TimedOut; `blocked` lists dependents blocked as a result
    TaskFailed {
        task_id: TaskId,
        status: TaskStatus,
        error: String,
        attempts: u32,
        blocked: Vec<TaskId>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        path: String,
        conflict_type: ConflictType,
        severity: Severity,
        contributors: Vec<TaskId>,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        path: String,
        resolution: Option<Resolution>,
        resolved_by: Option<String>,
    },
    OrchestrationCompleted {
        status: SessionStatus,
        total_tasks: usize,
        completed_tasks: usize,
        failed_tasks: usize,
        open_conflicts: usize,
        usage: ResourceUsage,
        duration_ms: Option<i64>,
    },
}

impl OrchestrationEvent {
    pub fn conflict_detected(conflict: &MergeConflict) -> Self {
        OrchestrationEvent::ConflictDetected {
            conflict_id: conflict.id,
            path: conflict.path.clone(),
            conflict_type: conflict.conflict_type.clone(),
            severity: conflict.severity,
            contributors: conflict.contributors.clone(),
        }
    }

    pub fn conflict_resolved(conflict: &MergeConflict) -> Self {
        OrchestrationEvent::ConflictResolved {
            conflict_id: conflict.id,
            path: conflict.path.clone(),
            resolution: conflict.resolution.clone(),
            resolved_by: conflict.resolved_by.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationEvent::TaskStarted { .. } => "TaskStarted",
            OrchestrationEvent::TaskCompleted { .. } => "TaskCompleted",
            OrchestrationEvent::TaskFailed { .. } => "TaskFailed",
            OrchestrationEvent::ConflictDetected { .. } => "ConflictDetected",
            OrchestrationEvent::ConflictResolved { .. } => "ConflictResolved",
            OrchestrationEvent::OrchestrationCompleted { .. } => "OrchestrationCompleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationEvent::OrchestrationCompleted { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::TaskStarted { task_id, .. }
            | OrchestrationEvent::TaskCompleted { task_id, .. }
            | OrchestrationEvent::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub version: u32,
    pub session_id: SessionId,
    /// Monotonic per session, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OrchestrationEvent,
}

impl StreamEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_envelope_serializes_flat() {
        let event = StreamEvent {
            version: EVENT_VERSION,
            session_id: Uuid::new_v4(),
            sequence: 3,
            timestamp: Utc::now(),
            event: OrchestrationEvent::TaskStarted {
                task_id: "api".into(),
                task_type: TaskType::Backend,
                name: "API".into(),
            },
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "TaskStarted");
        assert_eq!(json["taskId"], "api");
        assert_eq!(json["taskType"], "backend");
        assert_eq!(json["sequence"], 3);

        let back: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
