//! Process-wide pipeline counters
//!
//! Atomic counters for high-frequency events and a bounded, mutex-protected
//! window of run durations for percentile reporting.

use crate::pipeline::execution::{RunStatus, TaskStatus};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DURATION_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<PipelineMetrics> = Lazy::new(PipelineMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static PipelineMetrics {
    &METRICS
}

/// Counters for runs and tasks across all pipelines in this process
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_partial: AtomicU64,
    runs_failed: AtomicU64,

    task_attempts: AtomicU64,
    task_retries: AtomicU64,
    task_successes: AtomicU64,
    task_fallbacks: AtomicU64,
    task_failures: AtomicU64,
    task_timeouts: AtomicU64,
    deadline_skips: AtomicU64,
    late_trace_events: AtomicU64,

    // milliseconds
    run_durations: Mutex<Vec<u64>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_finished(&self, status: RunStatus, duration: Duration) {
        let counter = match status {
            RunStatus::Completed => &self.runs_completed,
            RunStatus::Partial => &self.runs_partial,
            RunStatus::Failed => &self.runs_failed,
            RunStatus::Pending | RunStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut durations) = self.run_durations.lock() {
            durations.push(duration.as_millis() as u64);
            if durations.len() > DURATION_WINDOW {
                durations.remove(0);
            }
        }
    }

    pub fn task_attempt(&self) {
        self.task_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_resolved(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Success => &self.task_successes,
            TaskStatus::Fallback => &self.task_fallbacks,
            TaskStatus::Failed => &self.task_failures,
            TaskStatus::Timeout => &self.task_timeouts,
            TaskStatus::Pending | TaskStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A task resolved without invoking its agent because the run halted
    pub fn deadline_skip(&self) {
        self.deadline_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_trace_events(&self, count: u64) {
        self.late_trace_events.fetch_add(count, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.runs_started,
            &self.runs_completed,
            &self.runs_partial,
            &self.runs_failed,
            &self.task_attempts,
            &self.task_retries,
            &self.task_successes,
            &self.task_fallbacks,
            &self.task_failures,
            &self.task_timeouts,
            &self.deadline_skips,
            &self.late_trace_events,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut durations) = self.run_durations.lock() {
            durations.clear();
        }
    }

    fn duration_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(durations) = self.run_durations.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if durations.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = durations.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg, p50, p95, p99) = self.duration_statistics();

        MetricsSnapshot {
            runs: RunMetrics {
                started: self.runs_started.load(Ordering::Relaxed),
                completed: self.runs_completed.load(Ordering::Relaxed),
                partial: self.runs_partial.load(Ordering::Relaxed),
                failed: self.runs_failed.load(Ordering::Relaxed),
                avg_duration_ms: avg,
                duration_p50_ms: p50,
                duration_p95_ms: p95,
                duration_p99_ms: p99,
            },
            tasks: TaskMetrics {
                attempts: self.task_attempts.load(Ordering::Relaxed),
                retries: self.task_retries.load(Ordering::Relaxed),
                successes: self.task_successes.load(Ordering::Relaxed),
                fallbacks: self.task_fallbacks.load(Ordering::Relaxed),
                failures: self.task_failures.load(Ordering::Relaxed),
                timeouts: self.task_timeouts.load(Ordering::Relaxed),
                deadline_skips: self.deadline_skips.load(Ordering::Relaxed),
            },
            late_trace_events: self.late_trace_events.load(Ordering::Relaxed),
            timestamp: current_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub runs: RunMetrics,
    pub tasks: TaskMetrics,
    pub late_trace_events: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub started: u64,
    pub completed: u64,
    pub partial: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub duration_p50_ms: f64,
    pub duration_p95_ms: f64,
    pub duration_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub deadline_skips: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
