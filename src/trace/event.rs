//! Trace event vocabulary

use crate::error::ErrorCategory;
use crate::pipeline::definition::ExecutionMode;
use crate::pipeline::execution::{RunStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A lifecycle event of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TraceEvent {
    PipelineStarted {
        pipeline: String,
        phases: usize,
    },
    PhaseStarted {
        phase_id: String,
        ordinal: usize,
        mode: ExecutionMode,
        tasks: usize,
    },
    /// First attempt of a task
    TaskStarted {
        phase_id: String,
        task_id: String,
        agent: String,
    },
    /// Every attempt after the first
    TaskRetried {
        phase_id: String,
        task_id: String,
        attempt: u32,
        previous_category: ErrorCategory,
        delay: Duration,
        corrective: bool,
    },
    /// Terminal resolution other than fallback
    TaskCompleted {
        phase_id: String,
        task_id: String,
        status: TaskStatus,
        attempts: u32,
        reason: Option<String>,
    },
    TaskFellBack {
        phase_id: String,
        task_id: String,
        attempts: u32,
        reason: String,
    },
    PhaseCompleted {
        phase_id: String,
        status: RunStatus,
        skipped: bool,
    },
    PipelineCompleted {
        status: RunStatus,
    },
}

impl TraceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::PipelineStarted { .. } => "pipelineStarted",
            TraceEvent::PhaseStarted { .. } => "phaseStarted",
            TraceEvent::TaskStarted { .. } => "taskStarted",
            TraceEvent::TaskRetried { .. } => "taskRetried",
            TraceEvent::TaskCompleted { .. } => "taskCompleted",
            TraceEvent::TaskFellBack { .. } => "taskFellBack",
            TraceEvent::PhaseCompleted { .. } => "phaseCompleted",
            TraceEvent::PipelineCompleted { .. } => "pipelineCompleted",
        }
    }

    pub fn phase_id(&self) -> Option<&str> {
        match self {
            TraceEvent::PhaseStarted { phase_id, .. }
            | TraceEvent::TaskStarted { phase_id, .. }
            | TraceEvent::TaskRetried { phase_id, .. }
            | TraceEvent::TaskCompleted { phase_id, .. }
            | TraceEvent::TaskFellBack { phase_id, .. }
            | TraceEvent::PhaseCompleted { phase_id, .. } => Some(phase_id),
            TraceEvent::PipelineStarted { .. } | TraceEvent::PipelineCompleted { .. } => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            TraceEvent::TaskStarted { task_id, .. }
            | TraceEvent::TaskRetried { task_id, .. }
            | TraceEvent::TaskCompleted { task_id, .. }
            | TraceEvent::TaskFellBack { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Whether this event resolves a task
    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self,
            TraceEvent::TaskCompleted { .. } | TraceEvent::TaskFellBack { .. }
        )
    }
}

/// Immutable, stamped trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Arrival order, starting at 0
    pub seq: u64,
    pub run_id: Uuid,
    /// Monotonic offset from run start
    pub offset: Duration,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}
