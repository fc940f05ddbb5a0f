//! Scripted executor shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use subagent_orchestra::{
    CancellationToken, ExecutionError, ExecutionRequest, OrchestrationConfig, OutputFile,
    ResourceUsage, TaskExecutor, TaskOutput,
};

/// How one task behaves when executed
#[derive(Debug, Clone, Default)]
pub struct Script {
    delay: Duration,
    output: TaskOutput,
    fail_first: u32,
    error: Option<ExecutionError>,
    wait_for_cancel: bool,
    ignore_cancel: bool,
    panic: bool,
}

impl Script {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn writes(mut self, path: &str, content: &str) -> Self {
        self.output = self.output.with_file(path, OutputFile::write(content));
        self
    }

    pub fn deletes(mut self, path: &str) -> Self {
        self.output = self.output.with_file(path, OutputFile::Delete);
        self
    }

    pub fn usage(mut self, input: u64, output: u64) -> Self {
        self.output = self.output.with_usage(ResourceUsage::new(input, output, 0.0));
        self
    }

    /// Fail the first `times` attempts with `error`
    pub fn fails(mut self, times: u32, error: ExecutionError) -> Self {
        self.fail_first = times;
        self.error = Some(error);
        self
    }

    pub fn always_fails(self, error: ExecutionError) -> Self {
        self.fails(u32::MAX, error)
    }

    /// Block until cancelled, then report cancellation
    pub fn waits_for_cancel(mut self) -> Self {
        self.wait_for_cancel = true;
        self
    }

    /// Sleep the full delay even when cancelled
    pub fn ignores_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn panics(mut self) -> Self {
        self.panic = true;
        self
    }
}

/// Executor that plays back per-task scripts and records what it saw
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    starts: Mutex<Vec<(String, u32)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(self: &Arc<Self>, task_id: &str, script: Script) -> Arc<Self> {
        self.scripts.lock().insert(task_id.to_string(), script);
        self.clone()
    }

    /// Task ids in the order their first attempt started
    pub fn start_order(&self) -> Vec<String> {
        self.starts
            .lock()
            .iter()
            .filter(|(_, attempt)| *attempt == 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn attempts(&self, task_id: &str) -> usize {
        self.starts.lock().iter().filter(|(id, _)| id == task_id).count()
    }

    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn perform(
        &self,
        script: &Script,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput, ExecutionError> {
        if script.wait_for_cancel {
            cancel.cancelled().await;
            return Err(ExecutionError::Cancelled);
        }
        if script.ignore_cancel {
            tokio::time::sleep(script.delay).await;
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(script.delay) => {}
            }
        }
        if request.attempt < script.fail_first {
            return Err(script
                .error
                .clone()
                .unwrap_or_else(|| ExecutionError::system("scripted failure")));
        }
        Ok(script.output.clone())
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, ExecutionError> {
        let script = self
            .scripts
            .lock()
            .get(&request.task_id)
            .cloned()
            .unwrap_or_default();
        self.starts
            .lock()
            .push((request.task_id.clone(), request.attempt));
        if script.panic {
            panic!("scripted panic in {}", request.task_id);
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.perform(&script, &request, &cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn config() -> OrchestrationConfig {
    OrchestrationConfig::development()
}
