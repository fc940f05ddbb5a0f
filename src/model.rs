use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::core::{OrchestraError, ResourceUsage, Result};

// Type aliases
pub type TaskId = String;
pub type SessionId = Uuid;
pub type ConflictId = Uuid;

/// Work stream a subagent task belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TaskType {
    Schema,
    Backend,
    Frontend,
    Tests,
    Docs,
    Custom(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Schema => "schema",
            TaskType::Backend => "backend",
            TaskType::Frontend => "frontend",
            TaskType::Tests => "tests",
            TaskType::Docs => "docs",
            TaskType::Custom(name) => name,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "schema" | "database" => TaskType::Schema,
            "backend" | "api" => TaskType::Backend,
            "frontend" | "ui" => TaskType::Frontend,
            "tests" | "test" => TaskType::Tests,
            "docs" | "doc" | "documentation" => TaskType::Docs,
            _ => TaskType::Custom(value.trim().to_string()),
        }
    }

    /// Case-insensitive match against a dependency reference
    pub fn matches(&self, reference: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(reference.trim())
            || TaskType::parse(reference) == *self
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        TaskType::parse(&value)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.as_str().to_string()
    }
}

/// Task status within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Blocked
                | TaskStatus::Cancelled
                | TaskStatus::TimedOut
        )
    }
}

/// Orchestration session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Completed,
    CompletedWithConflicts,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Planner-facing description of one task in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    /// Batch-local reference; falls back to the task type when empty
    #[serde(default)]
    pub key: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Opaque context handed to the executor
    #[serde(default)]
    pub context: Value,
    /// References to other tasks in the batch, by key or by task type
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskDescriptor {
    pub fn new(key: impl Into<String>, task_type: TaskType) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            task_type,
            description: String::new(),
            context: Value::Null,
            dependencies: Vec::new(),
            timeout_secs: None,
            max_retries: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Add a single dependency
    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retries(mut self, count: u32) -> Self {
        self.max_retries = Some(count);
        self
    }

    pub fn effective_key(&self) -> String {
        if self.key.trim().is_empty() {
            self.task_type.as_str().to_string()
        } else {
            self.key.trim().to_string()
        }
    }
}

/// A batch of task descriptors as produced by a planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<TaskDescriptor>,
}

impl TaskPlan {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self { tasks }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| OrchestraError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }
}

/// Runtime record of one task in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationTask {
    pub id: TaskId,
    pub session_id: SessionId,
    pub task_type: TaskType,
    pub name: String,
    pub description: String,
    pub context: Value,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub usage: ResourceUsage,
    pub output_paths: Vec<String>,
    pub error: Option<String>,
    pub status_reason: Option<String>,
}

impl OrchestrationTask {
    pub fn from_descriptor(
        session_id: SessionId,
        descriptor: &TaskDescriptor,
        dependencies: Vec<TaskId>,
    ) -> Self {
        Self {
            id: descriptor.effective_key(),
            session_id,
            task_type: descriptor.task_type.clone(),
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            context: descriptor.context.clone(),
            status: TaskStatus::Pending,
            dependencies,
            timeout_secs: descriptor.timeout_secs,
            max_retries: descriptor.max_retries,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            usage: ResourceUsage::default(),
            output_paths: Vec::new(),
            error: None,
            status_reason: None,
        }
    }
}

/// One orchestration run over one batch for one originating request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSession {
    pub id: SessionId,
    pub request_id: String,
    pub status: SessionStatus,
    pub concurrency_limit: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub usage: ResourceUsage,
}

impl OrchestrationSession {
    pub fn new(
        request_id: impl Into<String>,
        concurrency_limit: usize,
        total_tasks: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: request_id.into(),
            status: SessionStatus::Running,
            concurrency_limit,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            usage: ResourceUsage::default(),
        }
    }

    pub fn total_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
