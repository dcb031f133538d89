//! Replay a trace and check that lifecycle transitions are monotonic

use crate::pipeline::execution::{RunStatus, TaskStatus};
use crate::trace::event::{TraceEntry, TraceEvent};
use std::collections::BTreeMap;
use thiserror::Error;

/// A trace entry that breaks the lifecycle order
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionViolation {
    #[error("entry {seq} is out of sequence or stamped before its predecessor")]
    OutOfSequence { seq: u64 },

    #[error("entry {seq}: {event} for pipeline in the wrong state")]
    PipelineOutOfOrder { seq: u64, event: String },

    #[error("entry {seq}: {event} for phase '{phase_id}' in the wrong state")]
    PhaseOutOfOrder {
        seq: u64,
        phase_id: String,
        event: String,
    },

    #[error("entry {seq}: phase '{phase_id}' completed while task '{task_id}' was unresolved")]
    PhaseCompletedEarly {
        seq: u64,
        phase_id: String,
        task_id: String,
    },

    #[error("entry {seq}: {event} for task '{task_id}' before it started")]
    TaskNotStarted {
        seq: u64,
        task_id: String,
        event: String,
    },

    #[error("entry {seq}: {event} for task '{task_id}' after it reached a terminal status")]
    TaskAfterTerminal {
        seq: u64,
        task_id: String,
        event: String,
    },

    #[error("entry {seq}: {event} for task '{task_id}' outside its phase's lifetime")]
    TaskOutsidePhase {
        seq: u64,
        task_id: String,
        event: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseState {
    Running,
    Done(RunStatus),
}

/// Final states reconstructed from a valid trace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
    pub pipeline: Option<RunStatus>,
    pub phases: BTreeMap<String, RunStatus>,
    pub tasks: BTreeMap<String, TaskStatus>,
}

/// Check that no event reverts a terminal state or skips a lifecycle step
pub fn check_transitions(entries: &[TraceEntry]) -> Result<(), TransitionViolation> {
    replay(entries).map(|_| ())
}

/// Replay `entries` in order and return the final states they describe
pub fn replay(entries: &[TraceEntry]) -> Result<ReplayState, TransitionViolation> {
    let mut pipeline_started = false;
    let mut pipeline_status: Option<RunStatus> = None;
    let mut phases: BTreeMap<String, PhaseState> = BTreeMap::new();
    let mut tasks: BTreeMap<String, (String, TaskStatus)> = BTreeMap::new();
    let mut previous: Option<&TraceEntry> = None;

    for entry in entries {
        let seq = entry.seq;
        let event = entry.event.name().to_string();

        if let Some(prev) = previous {
            if entry.seq <= prev.seq || entry.offset < prev.offset {
                return Err(TransitionViolation::OutOfSequence { seq });
            }
        }
        previous = Some(entry);

        if pipeline_status.is_some() {
            return Err(TransitionViolation::PipelineOutOfOrder { seq, event });
        }
        if !pipeline_started && !matches!(entry.event, TraceEvent::PipelineStarted { .. }) {
            return Err(TransitionViolation::PipelineOutOfOrder { seq, event });
        }

        match &entry.event {
            TraceEvent::PipelineStarted { .. } => {
                if pipeline_started {
                    return Err(TransitionViolation::PipelineOutOfOrder { seq, event });
                }
                pipeline_started = true;
            }
            TraceEvent::PipelineCompleted { status } => {
                if phases.values().any(|p| *p == PhaseState::Running) {
                    return Err(TransitionViolation::PipelineOutOfOrder { seq, event });
                }
                pipeline_status = Some(*status);
            }
            TraceEvent::PhaseStarted { phase_id, .. } => {
                if phases.contains_key(phase_id) {
                    return Err(TransitionViolation::PhaseOutOfOrder {
                        seq,
                        phase_id: phase_id.clone(),
                        event,
                    });
                }
                phases.insert(phase_id.clone(), PhaseState::Running);
            }
            TraceEvent::PhaseCompleted {
                phase_id,
                status,
                skipped,
            } => {
                let allowed = match phases.get(phase_id) {
                    Some(PhaseState::Running) => !skipped,
                    Some(PhaseState::Done(_)) => false,
                    None => *skipped,
                };
                if !allowed {
                    return Err(TransitionViolation::PhaseOutOfOrder {
                        seq,
                        phase_id: phase_id.clone(),
                        event,
                    });
                }
                if let Some((task_id, _)) = tasks
                    .iter()
                    .find(|(_, (owner, status))| owner == phase_id && !status.is_terminal())
                {
                    return Err(TransitionViolation::PhaseCompletedEarly {
                        seq,
                        phase_id: phase_id.clone(),
                        task_id: task_id.clone(),
                    });
                }
                phases.insert(phase_id.clone(), PhaseState::Done(*status));
            }
            TraceEvent::TaskStarted {
                phase_id, task_id, ..
            } => {
                if phases.get(phase_id) != Some(&PhaseState::Running) {
                    return Err(TransitionViolation::TaskOutsidePhase {
                        seq,
                        task_id: task_id.clone(),
                        event,
                    });
                }
                if tasks.contains_key(task_id) {
                    return Err(TransitionViolation::TaskAfterTerminal {
                        seq,
                        task_id: task_id.clone(),
                        event,
                    });
                }
                tasks.insert(task_id.clone(), (phase_id.clone(), TaskStatus::Running));
            }
            TraceEvent::TaskRetried { task_id, .. } => match tasks.get(task_id) {
                Some((_, TaskStatus::Running)) => {}
                Some(_) => {
                    return Err(TransitionViolation::TaskAfterTerminal {
                        seq,
                        task_id: task_id.clone(),
                        event,
                    })
                }
                None => {
                    return Err(TransitionViolation::TaskNotStarted {
                        seq,
                        task_id: task_id.clone(),
                        event,
                    })
                }
            },
            TraceEvent::TaskCompleted {
                phase_id,
                task_id,
                status,
                attempts,
                ..
            } => {
                resolve_task(&mut tasks, &phases, seq, phase_id, task_id, *status, *attempts, event)?;
            }
            TraceEvent::TaskFellBack {
                phase_id,
                task_id,
                attempts,
                ..
            } => {
                resolve_task(
                    &mut tasks,
                    &phases,
                    seq,
                    phase_id,
                    task_id,
                    TaskStatus::Fallback,
                    *attempts,
                    event,
                )?;
            }
        }
    }

    Ok(ReplayState {
        pipeline: pipeline_status,
        phases: phases
            .into_iter()
            .filter_map(|(id, state)| match state {
                PhaseState::Done(status) => Some((id, status)),
                PhaseState::Running => None,
            })
            .collect(),
        tasks: tasks
            .into_iter()
            .map(|(id, (_, status))| (id, status))
            .collect(),
    })
}

#[allow(clippy::too_many_arguments)]
fn resolve_task(
    tasks: &mut BTreeMap<String, (String, TaskStatus)>,
    phases: &BTreeMap<String, PhaseState>,
    seq: u64,
    phase_id: &str,
    task_id: &str,
    status: TaskStatus,
    attempts: u32,
    event: String,
) -> Result<(), TransitionViolation> {
    if matches!(phases.get(phase_id), Some(PhaseState::Done(_))) {
        return Err(TransitionViolation::TaskOutsidePhase {
            seq,
            task_id: task_id.to_string(),
            event,
        });
    }
    match tasks.get(task_id) {
        Some((_, current)) if current.is_terminal() => {
            return Err(TransitionViolation::TaskAfterTerminal {
                seq,
                task_id: task_id.to_string(),
                event,
            })
        }
        Some(_) => {}
        // Tasks of skipped or short-circuited phases resolve without ever starting
        None if attempts == 0 => {}
        None => {
            return Err(TransitionViolation::TaskNotStarted {
                seq,
                task_id: task_id.to_string(),
                event,
            })
        }
    }
    tasks.insert(task_id.to_string(), (phase_id.to_string(), status));
    Ok(())
}
