use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Token and cost accounting reported by an executor for one task
///
/// The engine never interprets these numbers; it only sums them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl ResourceUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for ResourceUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cost_usd += rhs.cost_usd;
    }
}

/// Lock-free dispatch counters: running tasks, peak and total dispatched
#[derive(Debug, Default)]
pub struct UsageTracker {
    running_tasks: AtomicUsize,
    peak_running_tasks: AtomicUsize,
    total_dispatched: AtomicU64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch, returning the new number of running tasks
    pub fn task_started(&self) -> usize {
        let running = self.running_tasks.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running_tasks.fetch_max(running, Ordering::AcqRel);
        self.total_dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(running, "Task started");
        running
    }

    pub fn task_finished(&self) -> usize {
        let previous = self
            .running_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn running(&self) -> usize {
        self.running_tasks.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously running tasks seen so far
    pub fn peak_running(&self) -> usize {
        self.peak_running_tasks.load(Ordering::Acquire)
    }

    pub fn total_dispatched(&self) -> u64 {
        self.total_dispatched.load(Ordering::Relaxed)
    }
}
