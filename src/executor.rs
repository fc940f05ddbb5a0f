//! The task executor seam
//!
//! The engine never produces file content itself. It hands each task to a
//! [`TaskExecutor`] and aggregates the [`TaskOutput`] that comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::aggregate::extract::extract_files;
use crate::core::ResourceUsage;
use crate::model::{SessionId, TaskId, TaskType};

/// Everything an executor needs to run one attempt of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub name: String,
    pub description: String,
    pub context: Value,
    /// Zero-based attempt number
    pub attempt: u32,
}

/// One file-level effect of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutputFile {
    Write {
        content: String,
        #[serde(default)]
        language: Option<String>,
    },
    Delete,
}

impl OutputFile {
    pub fn write(content: impl Into<String>) -> Self {
        OutputFile::Write {
            content: content.into(),
            language: None,
        }
    }

    pub fn write_with_language(content: impl Into<String>, language: impl Into<String>) -> Self {
        OutputFile::Write {
            content: content.into(),
            language: Some(language.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub files: BTreeMap<String, OutputFile>,
    pub usage: ResourceUsage,
}

impl TaskOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, file: OutputFile) -> Self {
        self.files.insert(path.into(), file);
        self
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Build an output from markdown using `### path` headed code blocks
    ///
    /// A path that appears twice keeps its last block.
    pub fn from_markdown(markdown: &str) -> Self {
        let files = extract_files(markdown)
            .into_iter()
            .map(|f| {
                (
                    f.path,
                    OutputFile::Write {
                        content: f.content,
                        language: f.language,
                    },
                )
            })
            .collect();
        Self {
            files,
            usage: ResourceUsage::default(),
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

/// Errors reported by an executor for a single attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Bad input or a refusal; retrying will not help
    #[error("Task rejected: {0}")]
    User(String),

    /// Transient failure such as a provider outage
    #[error("Task failed: {0}")]
    System(String),

    /// The executor observed its cancellation token and stopped
    #[error("Task cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::System(format!("{:#}", err))
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, ExecutionError>;
}

/// Wrapper that lets an async closure act as an executor
pub struct FnExecutor<F> {
    func: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(ExecutionRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(ExecutionRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, ExecutionError> {
        let result = (self.func)(request, cancel.clone()).await;
        match result {
            Ok(output) => Ok(output),
            Err(err) => match err.downcast::<ExecutionError>() {
                Ok(exec_err) => Err(exec_err),
                Err(_) if cancel.is_cancelled() => Err(ExecutionError::Cancelled),
                Err(other) => Err(other.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            session_id: Uuid::new_v4(),
            task_id: "api".into(),
            task_type: TaskType::Backend,
            name: "API".into(),
            description: String::new(),
            context: Value::Null,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_fn_executor_maps_errors() {
        let executor = FnExecutor::new(|req: ExecutionRequest, _cancel| async move {
            if req.attempt == 0 {
                Err::<TaskOutput, _>(anyhow::Error::new(ExecutionError::user("bad prompt")))
            } else {
                Err(anyhow::anyhow!("provider timeout"))
            }
        });

        let err = executor
            .execute(request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::User("bad prompt".into()));
        assert!(!err.is_retryable());

        let mut second = request();
        second.attempt = 1;
        let err = executor
            .execute(second, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fn_executor_reports_cancellation() {
        let executor = FnExecutor::new(|_req, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err::<TaskOutput, _>(anyhow::anyhow!("stopped"))
        });
        let token = CancellationToken::new();
        token.cancel();
        let err = executor.execute(request(), token).await.unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }

    #[test]
    fn test_output_from_markdown() {
        let output = TaskOutput::from_markdown("### src/lib.rs\n```rust\npub fn x() {}\n```\n");
        assert_eq!(output.paths(), vec!["src/lib.rs".to_string()]);
        assert_eq!(
            output.files["src/lib.rs"],
            OutputFile::write_with_language("pub fn x() {}", "rust")
        );
    }
}
