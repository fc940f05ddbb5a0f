use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the orchestration engine
#[derive(Debug, Error)]
pub enum OrchestraError {
    /// An active session already exists for the originating request
    #[error("Orchestration already running for request {request_id} (session {session_id})")]
    AlreadyRunning { request_id: String, session_id: Uuid },

    /// The dependency graph contains a cycle
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A dependency reference does not resolve to a task in the same batch
    #[error("Unknown dependency '{dependency}' declared by task '{task}'")]
    UnknownDependency { task: String, dependency: String },

    /// A dependency reference matches the type of more than one task
    #[error("Ambiguous dependency '{dependency}' declared by task '{task}' (matches {})", candidates.join(", "))]
    AmbiguousDependency {
        task: String,
        dependency: String,
        candidates: Vec<String>,
    },

    #[error("Duplicate task key: {task}")]
    DuplicateTask { task: String },

    #[error("Task batch is empty")]
    EmptyBatch,

    #[error("Orchestration session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Merge conflict not found: {0}")]
    ConflictNotFound(Uuid),

    /// Resolution was requested for a conflict that is no longer open
    #[error("Merge conflict {conflict_id} is already resolved")]
    AlreadyResolved { conflict_id: Uuid },

    /// The winning task named in a resolution never wrote the conflicted path
    #[error("Task '{task_id}' did not contribute to merge conflict {conflict_id}")]
    UnknownContributor { conflict_id: Uuid, task_id: String },

    /// A facade request is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Failed to read {}", path.display())]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML/JSON parse failures for configs and task plans
    #[error("Failed to parse {format}")]
    Parse {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The external planner could not produce a task batch
    #[error("Task planning failed for request {request_id}: {message}")]
    Planning { request_id: String, message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OrchestraError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a named field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn parse<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Parse {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors that reject an orchestration before any task runs
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. }
                | Self::CycleDetected { .. }
                | Self::UnknownDependency { .. }
                | Self::AmbiguousDependency { .. }
                | Self::DuplicateTask { .. }
                | Self::EmptyBatch
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "conflict",
            Self::CycleDetected { .. }
            | Self::UnknownDependency { .. }
            | Self::AmbiguousDependency { .. }
            | Self::DuplicateTask { .. }
            | Self::EmptyBatch => "validation",
            Self::SessionNotFound(_) | Self::TaskNotFound(_) | Self::ConflictNotFound(_) => {
                "not_found"
            }
            Self::AlreadyResolved { .. } | Self::UnknownContributor { .. } => "resolution",
            Self::InvalidRequest(_) => "request",
            Self::Configuration { .. } | Self::ConfigLoad { .. } => "configuration",
            Self::Parse { .. } => "serialization",
            Self::Planning { .. } => "planning",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, OrchestraError>;

impl From<serde_json::Error> for OrchestraError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse("json", err)
    }
}

impl From<serde_yaml::Error> for OrchestraError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::parse("yaml", err)
    }
}
