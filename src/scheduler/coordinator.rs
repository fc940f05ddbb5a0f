//! Coordinator - the single writer of a session's task state
//!
//! Workers run in a `JoinSet` and report back through `join_next`. The
//! coordinator reacts to each result, updates state, publishes events and
//! dispatches whatever became runnable. Nothing polls.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handle::SessionContext;
use super::retry::RetryPolicy;
use crate::config::OrchestrationConfig;
use crate::executor::{ExecutionError, ExecutionRequest, TaskExecutor, TaskOutput};
use crate::model::{OrchestrationTask, SessionStatus, TaskId, TaskStatus};
use crate::stream::OrchestrationEvent;

/// What a worker reports once it stops trying
struct WorkerResult {
    task_id: TaskId,
    attempts: u32,
    outcome: WorkerOutcome,
}

enum WorkerOutcome {
    Succeeded(TaskOutput),
    Failed(ExecutionError),
    TimedOut(Duration),
    Cancelled,
    Panicked(String),
}

pub(super) struct Coordinator {
    ctx: Arc<SessionContext>,
    executor: Arc<dyn TaskExecutor>,
    config: Arc<OrchestrationConfig>,
    retry: RetryPolicy,
    workers: JoinSet<WorkerResult>,
    in_flight: HashSet<TaskId>,
    cancel_handled: bool,
}

impl Coordinator {
    pub(super) fn new(
        ctx: Arc<SessionContext>,
        executor: Arc<dyn TaskExecutor>,
        config: Arc<OrchestrationConfig>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            ctx,
            executor,
            config,
            retry,
            workers: JoinSet::new(),
            in_flight: HashSet::new(),
            cancel_handled: false,
        }
    }

    /// Drive the session to a terminal status
    pub(super) async fn run(mut self) -> SessionStatus {
        self.ctx.state.write().start();
        info!(
            session_id = %self.ctx.id,
            tasks = self.ctx.graph.len(),
            concurrency_limit = self.config.concurrency_limit,
            "Orchestration started"
        );

        self.promote_and_dispatch();

        while !self.workers.is_empty() {
            let cancel = self.ctx.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled(), if !self.cancel_handled => {
                    self.on_cancel();
                }
                joined = self.workers.join_next() => {
                    match joined {
                        Some(Ok(result)) => self.on_worker_result(result),
                        Some(Err(err)) => self.on_join_error(err),
                        None => {}
                    }
                    self.promote_and_dispatch();
                }
            }
        }

        if self.ctx.cancel.is_cancelled() && !self.cancel_handled {
            self.on_cancel();
        }
        self.finalize()
    }

    /// Move Pending tasks to Ready or Blocked, then fill free slots
    fn promote_and_dispatch(&mut self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }

        let to_start: Vec<OrchestrationTask> = {
            let mut state = self.ctx.state.write();
            for id in self.ctx.graph.order() {
                if state.task_status(id) != Some(TaskStatus::Pending) {
                    continue;
                }
                let mut all_completed = true;
                let mut unsettled = false;
                let mut failed_dependency = None;
                for dep in self.ctx.graph.dependencies(id) {
                    match state.task_status(dep) {
                        Some(TaskStatus::Completed) => {}
                        Some(status) if status.is_terminal() => {
                            all_completed = false;
                            if failed_dependency.is_none() {
                                failed_dependency = Some((dep.clone(), status));
                            }
                        }
                        _ => {
                            all_completed = false;
                            unsettled = true;
                        }
                    }
                }

                if all_completed {
                    state.mark_ready(id);
                } else if !unsettled {
                    if let Some((dep, status)) = failed_dependency {
                        state.mark_blocked(id, blocked_reason(&dep, status));
                    }
                }
            }

            let slots = self
                .config
                .concurrency_limit
                .saturating_sub(self.in_flight.len());
            state
                .ids_with_status(TaskStatus::Ready)
                .into_iter()
                .take(slots)
                .filter_map(|id| state.mark_running(&id))
                .collect()
        };

        for task in to_start {
            self.spawn_worker(task);
        }
    }

    fn spawn_worker(&mut self, task: OrchestrationTask) {
        let running = self.ctx.usage.task_started();
        self.in_flight.insert(task.id.clone());
        debug!(session_id = %self.ctx.id, task_id = %task.id, running, "Dispatching task");

        self.ctx.streamer.publish(OrchestrationEvent::TaskStarted {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            name: task.name.clone(),
        });

        let policy = match task.max_retries {
            Some(max) => self.retry.clone().with_max_retries(max),
            None => self.retry.clone(),
        };
        let timeout = self.config.task_timeout(task.timeout_secs);
        let grace = self.config.cancel_grace();
        let span = info_span!("task", session_id = %self.ctx.id, task_id = %task.id);
        let request = ExecutionRequest {
            session_id: task.session_id,
            task_id: task.id,
            task_type: task.task_type,
            name: task.name,
            description: task.description,
            context: task.context,
            attempt: 0,
        };

        self.workers.spawn(
            run_worker(
                self.executor.clone(),
                request,
                self.ctx.cancel.child_token(),
                policy,
                timeout,
                grace,
            )
            .instrument(span),
        );
    }

    fn on_worker_result(&mut self, result: WorkerResult) {
        let WorkerResult {
            task_id,
            attempts,
            outcome,
        } = result;
        self.in_flight.remove(&task_id);
        self.ctx.usage.task_finished();

        match outcome {
            WorkerOutcome::Succeeded(output) => self.complete_task(&task_id, attempts, output),
            WorkerOutcome::Failed(err) => {
                self.fail_task(&task_id, TaskStatus::Failed, attempts, err.to_string())
            }
            WorkerOutcome::TimedOut(limit) => self.fail_task(
                &task_id,
                TaskStatus::TimedOut,
                attempts,
                format!("timed out after {:?}", limit),
            ),
            WorkerOutcome::Panicked(message) => self.fail_task(
                &task_id,
                TaskStatus::Failed,
                attempts,
                format!("executor panicked: {}", message),
            ),
            WorkerOutcome::Cancelled => {
                self.ctx
                    .state
                    .write()
                    .mark_cancelled(&task_id, Some(attempts), "cancelled while running");
                info!(session_id = %self.ctx.id, task_id = %task_id, "Task cancelled");
            }
        }
    }

    fn complete_task(&mut self, task_id: &str, attempts: u32, output: TaskOutput) {
        let late = self.ctx.cancel.is_cancelled();
        if late && !self.config.aggregate_late_results {
            self.ctx.state.write().mark_cancelled(
                task_id,
                Some(attempts),
                "result discarded after cancellation",
            );
            info!(session_id = %self.ctx.id, task_id, "Late result discarded");
            return;
        }

        let report = self.ctx.aggregator.aggregate(task_id, &output);

        // conflicts found while merging this output go out ahead of its completion
        for update in &report.conflicts {
            let conflict = update.conflict();
            warn!(
                session_id = %self.ctx.id,
                conflict_id = %conflict.id,
                path = %conflict.path,
                severity = ?conflict.severity,
                "Merge conflict detected"
            );
            self.ctx
                .streamer
                .publish(OrchestrationEvent::conflict_detected(conflict));
        }
        for resolved in &report.auto_resolved {
            self.ctx
                .streamer
                .publish(OrchestrationEvent::conflict_resolved(resolved));
        }

        let completed =
            self.ctx
                .state
                .write()
                .mark_completed(task_id, attempts, output.paths(), output.usage);

        if let Some(task) = completed {
            info!(
                session_id = %self.ctx.id,
                task_id,
                attempts,
                files = task.output_paths.len(),
                late,
                "Task completed"
            );
            self.ctx.streamer.publish(OrchestrationEvent::TaskCompleted {
                task_id: task.id,
                duration_ms: task.duration_ms.unwrap_or(0),
                attempts,
                output_paths: task.output_paths,
                usage: task.usage,
                late,
            });
        }
    }

    fn fail_task(&mut self, task_id: &str, status: TaskStatus, attempts: u32, error: String) {
        let blocked: Vec<TaskId> = {
            let mut state = self.ctx.state.write();
            if state
                .mark_failed(task_id, status, attempts, error.clone())
                .is_none()
            {
                return;
            }
            if self.config.continue_on_partial_failure {
                // dependents are blocked once all their dependencies settle
                Vec::new()
            } else {
                self.ctx
                    .graph
                    .transitive_dependents(task_id)
                    .into_iter()
                    .filter(|dep| state.mark_blocked(dep, blocked_reason(task_id, status)))
                    .collect()
            }
        };

        warn!(
            session_id = %self.ctx.id,
            task_id,
            status = ?status,
            attempts,
            error = %error,
            blocked = blocked.len(),
            "Task failed"
        );
        self.ctx.streamer.publish(OrchestrationEvent::TaskFailed {
            task_id: task_id.to_string(),
            status,
            error,
            attempts,
            blocked,
        });
    }

    fn on_join_error(&mut self, err: JoinError) {
        // panics are caught inside the worker, so this is an abort
        error!(session_id = %self.ctx.id, error = %err, "Worker ended without a result");
    }

    fn on_cancel(&mut self) {
        self.cancel_handled = true;
        let mut state = self.ctx.state.write();
        let mut cancelled = 0;
        for status in [TaskStatus::Pending, TaskStatus::Ready] {
            for id in state.ids_with_status(status) {
                if state.mark_cancelled(&id, None, "orchestration cancelled") {
                    cancelled += 1;
                }
            }
        }
        info!(
            session_id = %self.ctx.id,
            cancelled,
            running = self.in_flight.len(),
            "Cancellation requested, waiting for running tasks"
        );
    }

    fn finalize(self) -> SessionStatus {
        let cancelled = self.ctx.cancel.is_cancelled();
        let (status, session, open_conflicts) = {
            let mut state = self.ctx.state.write();
            let leftovers: Vec<(TaskId, TaskStatus, u32)> = state
                .tasks()
                .filter(|t| !t.status.is_terminal())
                .map(|t| (t.id.clone(), t.status, t.attempts))
                .collect();
            for (id, status, attempts) in leftovers {
                if status == TaskStatus::Running {
                    state.mark_failed(
                        &id,
                        TaskStatus::Failed,
                        attempts,
                        "worker ended without reporting a result".to_string(),
                    );
                } else if cancelled {
                    state.mark_cancelled(&id, None, "orchestration cancelled");
                } else {
                    state.mark_blocked(&id, "dependencies never completed".to_string());
                }
            }

            // read under the state lock so a concurrent resolve settles correctly
            let open_conflicts = self.ctx.aggregator.open_conflict_count();
            let status = if cancelled {
                SessionStatus::Cancelled
            } else if open_conflicts > 0 {
                SessionStatus::CompletedWithConflicts
            } else {
                SessionStatus::Completed
            };
            state.finish(status);
            (status, state.session().clone(), open_conflicts)
        };

        info!(
            session_id = %self.ctx.id,
            status = ?status,
            completed = session.completed_tasks,
            failed = session.failed_tasks,
            open_conflicts,
            peak_running = self.ctx.usage.peak_running(),
            "Orchestration finished"
        );
        self.ctx
            .streamer
            .publish(OrchestrationEvent::OrchestrationCompleted {
                status,
                total_tasks: session.total_tasks,
                completed_tasks: session.completed_tasks,
                failed_tasks: session.failed_tasks,
                open_conflicts,
                usage: session.usage,
                duration_ms: session.total_duration_ms(),
            });
        status
    }
}

fn blocked_reason(dependency: &str, status: TaskStatus) -> String {
    let outcome = match status {
        TaskStatus::TimedOut => "timed out",
        TaskStatus::Blocked => "was blocked",
        TaskStatus::Cancelled => "was cancelled",
        _ => "failed",
    };
    format!("dependency '{}' {}", dependency, outcome)
}

async fn run_worker(
    executor: Arc<dyn TaskExecutor>,
    mut request: ExecutionRequest,
    cancel: CancellationToken,
    policy: RetryPolicy,
    timeout: Option<Duration>,
    grace: Duration,
) -> WorkerResult {
    let task_id = request.task_id.clone();
    let mut attempt = 0;
    loop {
        request.attempt = attempt;
        let outcome = execute_once(&executor, request.clone(), &cancel, timeout, grace).await;

        let retry = match &outcome {
            WorkerOutcome::Failed(err) => {
                !cancel.is_cancelled() && policy.should_retry(err, attempt)
            }
            _ => false,
        };
        if !retry {
            return WorkerResult {
                task_id,
                attempts: attempt + 1,
                outcome,
            };
        }

        let delay = policy.delay_for(attempt);
        if let WorkerOutcome::Failed(err) = &outcome {
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying task");
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return WorkerResult {
                    task_id,
                    attempts: attempt + 1,
                    outcome: WorkerOutcome::Cancelled,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

async fn execute_once(
    executor: &Arc<dyn TaskExecutor>,
    request: ExecutionRequest,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    grace: Duration,
) -> WorkerOutcome {
    let attempt_token = cancel.child_token();
    let call = AssertUnwindSafe(executor.execute(request, attempt_token.clone())).catch_unwind();
    tokio::pin!(call);

    let joined = match timeout {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, &mut call).await {
            Ok(joined) => joined,
            Err(_) => {
                attempt_token.cancel();
                if tokio::time::timeout(grace, &mut call).await.is_err() {
                    debug!(
                        grace_ms = grace.as_millis() as u64,
                        "Executor ignored cancellation, dropping call"
                    );
                }
                return WorkerOutcome::TimedOut(limit);
            }
        },
    };

    match joined {
        Ok(Ok(output)) => WorkerOutcome::Succeeded(output),
        Ok(Err(ExecutionError::Cancelled)) => WorkerOutcome::Cancelled,
        Ok(Err(err)) => WorkerOutcome::Failed(err),
        Err(panic) => WorkerOutcome::Panicked(panic_message(panic.as_ref())),
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
