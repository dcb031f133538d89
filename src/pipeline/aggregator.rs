//! Merge phase executions into the final pipeline result
//!
//! Every declared task yields exactly one [`Section`], in phase order and
//! then declared task order. Sections never disappear: a task without a
//! usable payload is reported with state `missing` and the reason.

use crate::pipeline::execution::{
    HaltReason, PhaseExecution, PipelineRun, RunFailure, RunStatus, TaskExecution, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// How a section's content was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionState {
    /// Genuine agent output
    Resolved,
    /// Static fallback payload
    Fallback,
    Missing,
}

/// One entry of the final result, keyed by task id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub id: String,
    pub phase_id: String,
    pub state: SectionState,
    pub payload: Option<Value>,
    pub used_fallback: bool,
    /// Task the payload is attributed to
    pub attribution: String,
    pub status: TaskStatus,
    /// Why the content is degraded or missing
    pub reason: Option<String>,
}

impl Section {
    fn from_task(phase: &PhaseExecution, task: &TaskExecution) -> Self {
        let (state, payload, reason) = if phase.is_aborted() {
            (SectionState::Missing, None, phase.reason.clone())
        } else {
            match (task.status, task.payload()) {
                (TaskStatus::Success, Some(payload)) => {
                    (SectionState::Resolved, Some(payload.clone()), None)
                }
                (TaskStatus::Fallback, Some(payload)) => (
                    SectionState::Fallback,
                    Some(payload.clone()),
                    task.reason.clone(),
                ),
                _ => (
                    SectionState::Missing,
                    None,
                    task.reason
                        .clone()
                        .or_else(|| Some(format!("task ended with status {}", task.status))),
                ),
            }
        };

        Self {
            id: task.task_id.clone(),
            phase_id: phase.phase_id.clone(),
            used_fallback: state == SectionState::Fallback,
            state,
            payload,
            attribution: task.task_id.clone(),
            status: task.status,
            reason,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.state == SectionState::Missing
    }
}

/// Final output of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub sections: Vec<Section>,
    pub failure: Option<RunFailure>,
    pub halted: Option<HaltReason>,
    pub duration: Duration,
}

impl PipelineResult {
    pub fn get(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn missing(&self) -> Vec<&Section> {
        self.sections.iter().filter(|s| s.is_missing()).collect()
    }

    pub fn fallback_count(&self) -> usize {
        self.sections.iter().filter(|s| s.used_fallback).count()
    }

    /// Sections as a JSON object keyed by section id
    pub fn sections_by_id(&self) -> Value {
        let sections: Map<String, Value> = self
            .sections
            .iter()
            .map(|s| {
                let entry = match s.state {
                    SectionState::Missing => json!({
                        "missing": true,
                        "attribution": s.attribution,
                        "reason": s.reason,
                    }),
                    _ => json!({
                        "payload": s.payload,
                        "used_fallback": s.used_fallback,
                        "attribution": s.attribution,
                        "reason": s.reason,
                    }),
                };
                (s.id.clone(), entry)
            })
            .collect();
        Value::Object(sections)
    }
}

/// Builds [`PipelineResult`]s from phase executions
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// One section per declared task, in execution order
    pub fn merge(&self, phases: &[PhaseExecution]) -> Vec<Section> {
        phases
            .iter()
            .flat_map(|phase| {
                phase
                    .tasks
                    .iter()
                    .map(move |task| Section::from_task(phase, task))
            })
            .collect()
    }

    pub fn finalize(&self, run: &PipelineRun) -> PipelineResult {
        PipelineResult {
            run_id: run.run_id,
            pipeline: run.pipeline.clone(),
            status: run.status,
            sections: self.merge(&run.phases),
            failure: run.failure.clone(),
            halted: run.halted.clone(),
            duration: run.duration(),
        }
    }
}
