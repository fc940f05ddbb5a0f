// Core infrastructure modules
pub mod core;
pub mod config;
pub mod logging;
pub mod model;

// Orchestration pipeline, leaf first
pub mod graph;      // Dependency graph validation and canonical order
pub mod executor;   // Task executor seam
pub mod conflict;   // Conflict detection and resolution
pub mod aggregate;  // Merging task outputs into one file set
pub mod stream;     // Ordered per-session event fan-out
pub mod scheduler;  // Session coordinator
pub mod service;    // In-process facade for the external operations

// Re-exports for convenience
pub use crate::core::errors::{OrchestraError, Result};
pub use crate::core::usage::{ResourceUsage, UsageTracker};
pub use config::{
    ConflictConfig, LoggingConfig, OrchestrationConfig, OrchestrationConfigBuilder, RetryConfig,
    StreamConfig,
};
pub use logging::init_tracing;
pub use model::{
    ConflictId, OrchestrationSession, OrchestrationTask, SessionId, SessionStatus, TaskDescriptor,
    TaskId, TaskPlan, TaskStatus, TaskType,
};

pub use aggregate::{AggregatedFile, ContentKind, ResultAggregator};
pub use conflict::{
    ConflictStatus, ConflictType, MergeConflict, Resolution, ResolutionChoice, Severity,
};
pub use executor::{
    ExecutionError, ExecutionRequest, FnExecutor, OutputFile, TaskExecutor, TaskOutput,
};
pub use graph::{DependencyEdge, GraphSnapshot, TaskGraph};
pub use scheduler::{launch, SessionHandle};
pub use service::{OrchestrationService, ResolveRequest, TaskPlanner};
pub use stream::{EventSubscription, OrchestrationEvent, StreamEvent};

// Executors receive this token
pub use tokio_util::sync::CancellationToken;
