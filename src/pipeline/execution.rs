//! Mutable per-run records
//!
//! Ownership follows scope: the task runner builds its [`TaskExecution`],
//! the phase scheduler builds its [`PhaseExecution`], and only the executor
//! touches the [`PipelineRun`]. Once a record reaches a terminal status it
//! is never modified again.

use crate::error::ErrorCategory;
use crate::pipeline::aggregator::PipelineResult;
use crate::pipeline::definition::ExecutionMode;
use crate::trace::TraceCollector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A point in time relative to the start of a run
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stamp {
    #[serde(skip)]
    pub instant: Instant,
    /// Monotonic offset from run start
    pub offset: Duration,
    pub wall: DateTime<Utc>,
}

impl Stamp {
    pub fn new(instant: Instant, origin: Instant, wall: DateTime<Utc>) -> Self {
        Self {
            instant,
            offset: instant.saturating_duration_since(origin),
            wall,
        }
    }
}

/// Status vocabulary shared by runs and phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Abandoned at the pipeline deadline with no fallback
    Timeout,
    Fallback,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Fallback
        )
    }

    /// Whether the task leaves a payload downstream phases can read
    pub fn is_usable(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fallback)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Fallback => "FALLBACK",
        };
        f.write_str(name)
    }
}

/// One call to the agent
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub index: u32,
    pub started: Stamp,
    pub duration: Duration,
    /// `None` when the attempt succeeded
    pub category: Option<ErrorCategory>,
    pub error: Option<String>,
    /// Whether the input was the corrective variant after a validation failure
    pub corrective: bool,
}

/// Execution record of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub phase_id: String,
    pub agent: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub attempts: Vec<AttemptRecord>,
    /// Agent output on success, fallback payload on fallback
    pub output: Option<Value>,
    /// Human-readable explanation for any non-success outcome
    pub reason: Option<String>,
    pub required: bool,
    pub started: Option<Stamp>,
    pub finished: Option<Stamp>,
}

impl TaskExecution {
    pub fn pending(
        task_id: impl Into<String>,
        phase_id: impl Into<String>,
        agent: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            phase_id: phase_id.into(),
            agent: agent.into(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            attempts: Vec::new(),
            output: None,
            reason: None,
            required,
            started: None,
            finished: None,
        }
    }

    /// Payload visible to the next phase, if any
    pub fn payload(&self) -> Option<&Value> {
        if self.status.is_usable() {
            self.output.as_ref()
        } else {
            None
        }
    }

    pub fn used_fallback(&self) -> bool {
        self.status == TaskStatus::Fallback
    }

    pub fn retries(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }

    /// Wall time from first attempt to resolution
    pub fn duration(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => {
                finished.instant.saturating_duration_since(started.instant)
            }
            _ => Duration::ZERO,
        }
    }
}

/// Execution record of one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseExecution {
    pub phase_id: String,
    pub ordinal: usize,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    /// Task records in declared order
    pub tasks: Vec<TaskExecution>,
    pub started: Option<Stamp>,
    pub finished: Option<Stamp>,
    /// Task whose failure aborted the phase
    pub aborted_by: Option<String>,
    /// Set when the phase was never started
    pub skipped: bool,
    pub reason: Option<String>,
    /// `{task_id: payload}` over usable tasks; empty when aborted
    pub merged_output: Value,
}

impl PhaseExecution {
    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted_by.is_some()
    }

    /// An executed phase none of whose required tasks produced a usable payload
    pub fn is_catastrophic(&self) -> bool {
        if self.skipped {
            return false;
        }
        let mut required = self.tasks.iter().filter(|t| t.required).peekable();
        if required.peek().is_none() {
            return false;
        }
        !required.any(|t| t.status.is_usable())
    }

    pub fn duration(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => {
                finished.instant.saturating_duration_since(started.instant)
            }
            _ => Duration::ZERO,
        }
    }
}

/// Why the executor stopped launching phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    DeadlineExceeded,
    Cancelled,
    UpstreamFailed { phase_id: String },
}

impl HaltReason {
    pub fn describe(&self) -> String {
        match self {
            HaltReason::DeadlineExceeded => "pipeline deadline exceeded".to_string(),
            HaltReason::Cancelled => "pipeline run cancelled".to_string(),
            HaltReason::UpstreamFailed { phase_id } => {
                format!("upstream phase '{phase_id}' failed")
            }
        }
    }
}

/// Structured reason attached to a FAILED run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub phase_id: String,
    pub reason: String,
}

/// One invocation of a pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub started: Stamp,
    pub finished: Option<Stamp>,
    pub phases: Vec<PhaseExecution>,
    pub result: Option<PipelineResult>,
    pub failure: Option<RunFailure>,
    pub halted: Option<HaltReason>,
    #[serde(skip)]
    pub trace: Arc<TraceCollector>,
}

impl PipelineRun {
    pub fn new(
        run_id: Uuid,
        pipeline: impl Into<String>,
        started: Stamp,
        trace: Arc<TraceCollector>,
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            status: RunStatus::Pending,
            started,
            finished: None,
            phases: Vec::new(),
            result: None,
            failure: None,
            halted: None,
            trace,
        }
    }

    pub fn duration(&self) -> Duration {
        self.finished
            .map(|f| f.instant.saturating_duration_since(self.started.instant))
            .unwrap_or_default()
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseExecution> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.phases.iter().find_map(|p| p.task(task_id))
    }

    pub fn total_retries(&self) -> u32 {
        self.phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .map(TaskExecution::retries)
            .sum()
    }
}
