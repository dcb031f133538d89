//! Aggregate view over a run's trace

use crate::pipeline::execution::{RunStatus, TaskStatus};
use crate::trace::event::{TraceEntry, TraceEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Timing of one task as seen by the trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub task_id: String,
    pub phase_id: String,
    pub status: Option<TaskStatus>,
    pub attempts: u32,
    pub retries: u32,
    pub used_fallback: bool,
    /// From first attempt to resolution; zero for tasks never started
    pub duration: Duration,
    #[serde(skip)]
    started_at: Option<Duration>,
}

/// Per-phase rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseBreakdown {
    pub phase_id: String,
    pub status: Option<RunStatus>,
    pub skipped: bool,
    pub duration: Duration,
    pub tasks: usize,
    pub retries: u32,
    pub fallbacks: usize,
    pub failures: usize,
    #[serde(skip)]
    started_at: Option<Duration>,
}

/// Data surface consumed by dashboards and tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub run_id: Uuid,
    pub status: Option<RunStatus>,
    pub end_to_end: Duration,
    pub event_count: usize,
    pub total_tasks: usize,
    pub total_retries: u32,
    pub fallback_count: usize,
    /// Fallback tasks over resolved tasks
    pub fallback_ratio: f64,
    pub tasks: Vec<TaskTiming>,
    pub phases: Vec<PhaseBreakdown>,
}

impl TraceSummary {
    pub fn from_entries(run_id: Uuid, entries: &[TraceEntry]) -> Self {
        let mut tasks: Vec<TaskTiming> = Vec::new();
        let mut task_index: HashMap<String, usize> = HashMap::new();
        let mut phases: Vec<PhaseBreakdown> = Vec::new();
        let mut phase_index: HashMap<String, usize> = HashMap::new();
        let mut run_started = None;
        let mut run_finished = None;
        let mut status = None;

        for entry in entries {
            if let Some(phase_id) = entry.event.phase_id() {
                let idx = *phase_index.entry(phase_id.to_string()).or_insert_with(|| {
                    phases.push(PhaseBreakdown::new(phase_id));
                    phases.len() - 1
                });
                phases[idx].apply(entry);
            }

            if let (Some(task_id), Some(phase_id)) = (entry.event.task_id(), entry.event.phase_id())
            {
                let idx = *task_index.entry(task_id.to_string()).or_insert_with(|| {
                    tasks.push(TaskTiming::new(task_id, phase_id));
                    tasks.len() - 1
                });
                tasks[idx].apply(entry);
            }

            match &entry.event {
                TraceEvent::PipelineStarted { .. } => run_started = Some(entry.offset),
                TraceEvent::PipelineCompleted { status: s } => {
                    run_finished = Some(entry.offset);
                    status = Some(*s);
                }
                _ => {}
            }
        }

        for phase in &mut phases {
            let members = tasks.iter().filter(|t| t.phase_id == phase.phase_id);
            for task in members {
                phase.tasks += 1;
                phase.retries += task.retries;
                if task.used_fallback {
                    phase.fallbacks += 1;
                }
                if matches!(task.status, Some(TaskStatus::Failed | TaskStatus::Timeout)) {
                    phase.failures += 1;
                }
            }
        }

        let first = entries.first().map(|e| e.offset);
        let last = entries.last().map(|e| e.offset);
        let end_to_end = match (run_started.or(first), run_finished.or(last)) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => Duration::ZERO,
        };

        let resolved = tasks.iter().filter(|t| t.status.is_some()).count();
        let fallback_count = tasks.iter().filter(|t| t.used_fallback).count();
        let fallback_ratio = if resolved == 0 {
            0.0
        } else {
            fallback_count as f64 / resolved as f64
        };

        Self {
            run_id,
            status,
            end_to_end,
            event_count: entries.len(),
            total_tasks: tasks.len(),
            total_retries: tasks.iter().map(|t| t.retries).sum(),
            fallback_count,
            fallback_ratio,
            tasks,
            phases,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskTiming> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseBreakdown> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }
}

impl TaskTiming {
    fn new(task_id: &str, phase_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            status: None,
            attempts: 0,
            retries: 0,
            used_fallback: false,
            duration: Duration::ZERO,
            started_at: None,
        }
    }

    fn apply(&mut self, entry: &TraceEntry) {
        match &entry.event {
            TraceEvent::TaskStarted { .. } => {
                self.started_at = Some(entry.offset);
                self.attempts = self.attempts.max(1);
            }
            TraceEvent::TaskRetried { attempt, .. } => {
                self.retries += 1;
                self.attempts = self.attempts.max(*attempt);
            }
            TraceEvent::TaskCompleted {
                status, attempts, ..
            } => {
                self.status = Some(*status);
                self.attempts = *attempts;
                self.finish(entry.offset);
            }
            TraceEvent::TaskFellBack { attempts, .. } => {
                self.status = Some(TaskStatus::Fallback);
                self.used_fallback = true;
                self.attempts = *attempts;
                self.finish(entry.offset);
            }
            _ => {}
        }
    }

    fn finish(&mut self, at: Duration) {
        if let Some(start) = self.started_at {
            self.duration = at.saturating_sub(start);
        }
    }
}

impl PhaseBreakdown {
    fn new(phase_id: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            status: None,
            skipped: false,
            duration: Duration::ZERO,
            tasks: 0,
            retries: 0,
            fallbacks: 0,
            failures: 0,
            started_at: None,
        }
    }

    fn apply(&mut self, entry: &TraceEntry) {
        match &entry.event {
            TraceEvent::PhaseStarted { .. } => self.started_at = Some(entry.offset),
            TraceEvent::PhaseCompleted {
                status, skipped, ..
            } => {
                self.status = Some(*status);
                self.skipped = *skipped;
                if let Some(start) = self.started_at {
                    self.duration = entry.offset.saturating_sub(start);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::pipeline::definition::ExecutionMode;
    use chrono::Utc;

    fn entry(seq: u64, ms: u64, event: TraceEvent) -> TraceEntry {
        TraceEntry {
            seq,
            run_id: Uuid::nil(),
            offset: Duration::from_millis(ms),
            recorded_at: Utc::now(),
            event,
        }
    }

    fn sample() -> Vec<TraceEntry> {
        let p = || "research".to_string();
        vec![
            entry(0, 0, TraceEvent::PipelineStarted { pipeline: "bundle".into(), phases: 1 }),
            entry(1, 0, TraceEvent::PhaseStarted { phase_id: p(), ordinal: 0, mode: ExecutionMode::Parallel, tasks: 2 }),
            entry(2, 0, TraceEvent::TaskStarted { phase_id: p(), task_id: "a".into(), agent: "x".into() }),
            entry(3, 0, TraceEvent::TaskStarted { phase_id: p(), task_id: "b".into(), agent: "y".into() }),
            entry(4, 40, TraceEvent::TaskCompleted { phase_id: p(), task_id: "a".into(), status: TaskStatus::Success, attempts: 1, reason: None }),
            entry(5, 100, TraceEvent::TaskRetried { phase_id: p(), task_id: "b".into(), attempt: 2, previous_category: ErrorCategory::Timeout, delay: Duration::ZERO, corrective: false }),
            entry(6, 200, TraceEvent::TaskFellBack { phase_id: p(), task_id: "b".into(), attempts: 2, reason: "timed out after 2 attempts".into() }),
            entry(7, 200, TraceEvent::PhaseCompleted { phase_id: p(), status: RunStatus::Partial, skipped: false }),
            entry(8, 210, TraceEvent::PipelineCompleted { status: RunStatus::Partial }),
        ]
    }

    #[test]
    fn test_summary_per_task_metrics() {
        let summary = TraceSummary::from_entries(Uuid::nil(), &sample());

        let a = summary.task("a").unwrap();
        assert_eq!(a.duration, Duration::from_millis(40));
        assert_eq!(a.retries, 0);
        assert_eq!(a.status, Some(TaskStatus::Success));

        let b = summary.task("b").unwrap();
        assert_eq!(b.duration, Duration::from_millis(200));
        assert_eq!(b.retries, 1);
        assert_eq!(b.attempts, 2);
        assert!(b.used_fallback);
    }

    #[test]
    fn test_summary_totals_and_breakdown() {
        let summary = TraceSummary::from_entries(Uuid::nil(), &sample());

        assert_eq!(summary.status, Some(RunStatus::Partial));
        assert_eq!(summary.end_to_end, Duration::from_millis(210));
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.total_retries, 1);
        assert_eq!(summary.fallback_count, 1);
        assert!((summary.fallback_ratio - 0.5).abs() < f64::EPSILON);

        let phase = summary.phase("research").unwrap();
        assert_eq!(phase.tasks, 2);
        assert_eq!(phase.fallbacks, 1);
        assert_eq!(phase.duration, Duration::from_millis(200));
        assert!(!phase.skipped);
    }

    #[test]
    fn test_empty_trace_summary() {
        let summary = TraceSummary::from_entries(Uuid::nil(), &[]);
        assert_eq!(summary.end_to_end, Duration::ZERO);
        assert_eq!(summary.fallback_ratio, 0.0);
        assert!(summary.tasks.is_empty());
    }
}
