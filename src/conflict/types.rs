use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::content::ContentKind;
use crate::model::{ConflictId, SessionId, TaskId};

/// Ordered so that `max` picks the most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConflictType {
    /// Same kind, different bytes
    Content,
    /// The candidates disagree on what kind of file this is
    #[serde(rename_all = "camelCase")]
    Type {
        existing: ContentKind,
        incoming: ContentKind,
    },
    /// One side deleted the path while another wrote it
    #[serde(rename_all = "camelCase")]
    Structural { deleted_by: TaskId },
}

/// What one contributor proposed for the path; `content == None` is a deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCandidate {
    pub task_id: TaskId,
    pub content: Option<String>,
    pub kind: ContentKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "camelCase")]
pub enum Resolution {
    #[serde(rename_all = "camelCase")]
    WinningTask { task_id: TaskId },
    MergedContent { content: String },
    AutoMerged { content: String },
}

/// Caller's choice when resolving a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionChoice {
    WinningTask(TaskId),
    MergedContent(String),
    /// Attempt a line merge; leaves the conflict open when it is ambiguous
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub id: ConflictId,
    pub session_id: SessionId,
    pub path: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub contributors: Vec<TaskId>,
    pub candidates: Vec<ConflictCandidate>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
    pub description: String,
}

impl MergeConflict {
    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Open
    }

    pub fn candidate(&self, task_id: &str) -> Option<&ConflictCandidate> {
        self.candidates.iter().find(|c| c.task_id == task_id)
    }

    pub fn has_contributor(&self, task_id: &str) -> bool {
        self.contributors.iter().any(|t| t == task_id)
    }
}
