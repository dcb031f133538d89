//! Phase execution: input mapping, fan-out and the fan-in barrier
//!
//! A phase completes only after every one of its tasks has reached a
//! terminal status. Parallel tasks run as spawned tokio tasks joined in
//! declared order; sequential tasks run inline and may read the outputs of
//! earlier tasks they declare in `depends_on`.

use crate::clock::instant_after;
use crate::observability::metrics;
use crate::pipeline::context::RunContext;
use crate::pipeline::definition::{ExecutionMode, FallbackPolicy, PhaseDefinition, TaskDefinition};
use crate::pipeline::execution::{
    HaltReason, PhaseExecution, RunStatus, Stamp, TaskExecution, TaskStatus,
};
use crate::pipeline::runner::{resolve_abandoned, resolve_without_invocation, TaskRunner};
use crate::trace::TraceEvent;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Spawned task handles; dropping the set aborts whatever is still running
#[derive(Default)]
struct TaskSet {
    handles: Vec<JoinHandle<TaskExecution>>,
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Finished task records, still readable after the phase future is dropped
#[derive(Clone)]
struct Progress {
    slots: Arc<Mutex<Vec<Option<TaskExecution>>>>,
}

impl Progress {
    fn new(len: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(vec![None; len])),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<TaskExecution>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, index: usize, exec: &TaskExecution) {
        if let Some(slot) = self.lock().get_mut(index) {
            *slot = Some(exec.clone());
        }
    }

    /// Drain the slots; later stores become no-ops
    fn take(&self) -> Vec<Option<TaskExecution>> {
        std::mem::take(&mut *self.lock())
    }
}

/// Runs the tasks of one phase to completion
pub struct PhaseScheduler {
    runner: Arc<TaskRunner>,
    /// Time past the run deadline after which unfinished tasks are dropped
    grace: Duration,
}

impl PhaseScheduler {
    pub fn new(runner: Arc<TaskRunner>, grace: Duration) -> Self {
        Self { runner, grace }
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Execute `phase` against the previous phase's merged output
    pub async fn run_phase(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        previous: &Value,
    ) -> PhaseExecution {
        let span = crate::phase_span!(
            run_id = %ctx.run_id(),
            phase_id = %phase.id,
            mode = %phase.mode
        );

        async move {
            let started = ctx.stamp();
            ctx.record(TraceEvent::PhaseStarted {
                phase_id: phase.id.clone(),
                ordinal: phase.ordinal,
                mode: phase.mode,
                tasks: phase.tasks.len(),
            });
            info!(
                ordinal = phase.ordinal,
                tasks = phase.tasks.len(),
                input_mapping = %phase.input_mapping.describe(),
                "Phase started"
            );

            let progress = Progress::new(phase.tasks.len());
            let hard_stop = instant_after(ctx.deadline(), self.grace);

            let finished = tokio::select! {
                biased;
                tasks = self.execute(ctx, phase, previous, &progress) => Some(tasks),
                _ = ctx.clock().sleep(hard_stop.saturating_duration_since(ctx.now())) => None,
            };

            let tasks = match finished {
                Some(tasks) => tasks,
                None => {
                    warn!("Phase outlived the cancellation grace period, abandoning unfinished tasks");
                    abandon(ctx, phase, progress.take())
                }
            };

            complete(ctx, phase, tasks, started)
        }
        .instrument(span)
        .await
    }

    /// Resolve every task of a phase that will never start
    pub fn skip_phase(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        halt: &HaltReason,
    ) -> PhaseExecution {
        let reason = halt.describe();
        warn!(phase_id = %phase.id, reason = %reason, "Skipping phase");

        let tasks: Vec<TaskExecution> = phase
            .tasks
            .iter()
            .map(|task| {
                if *halt == HaltReason::DeadlineExceeded {
                    metrics().deadline_skip();
                }
                resolve_without_invocation(ctx, &phase.id, task, reason.clone(), true)
            })
            .collect();

        let status = phase_status(&tasks, false);
        let finished = ctx.stamp();
        ctx.record(TraceEvent::PhaseCompleted {
            phase_id: phase.id.clone(),
            status,
            skipped: true,
        });

        PhaseExecution {
            phase_id: phase.id.clone(),
            ordinal: phase.ordinal,
            mode: phase.mode,
            status,
            merged_output: merge_payloads(&tasks),
            tasks,
            started: None,
            finished: Some(finished),
            aborted_by: None,
            skipped: true,
            reason: Some(reason),
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        previous: &Value,
        progress: &Progress,
    ) -> Vec<TaskExecution> {
        match phase.mode {
            ExecutionMode::Parallel => self.run_parallel(ctx, phase, previous, progress).await,
            ExecutionMode::Sequential => {
                self.run_sequential(ctx, phase, previous, progress).await
            }
        }
    }

    async fn run_parallel(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        previous: &Value,
        progress: &Progress,
    ) -> Vec<TaskExecution> {
        let limit = phase
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let aborted_by: Arc<OnceLock<String>> = Arc::default();
        let mut set = TaskSet::default();

        for (index, task) in phase.tasks.iter().enumerate() {
            let input = phase.input_mapping.map(previous, task);
            let runner = self.runner.clone();
            let ctx = ctx.clone();
            let phase_id = phase.id.clone();
            let task = task.clone();
            let limit = limit.clone();
            let progress = progress.clone();
            let aborted_by = aborted_by.clone();

            let work = async move {
                let permit = match limit {
                    Some(semaphore) => Some(semaphore.acquire_owned().await.ok()),
                    None => None,
                };
                // Only tasks that queued for a permit can still be held back
                let exec = match aborted_by.get() {
                    Some(aborting) if permit.is_some() => {
                        let reason = format!("phase aborted by task '{aborting}'");
                        resolve_without_invocation(&ctx, &phase_id, &task, reason, false)
                    }
                    _ => runner.invoke(&ctx, &phase_id, &task, input).await,
                };
                if aborts_phase(&task, &exec) && aborted_by.set(task.id.clone()).is_ok() {
                    warn!(task_id = %task.id, "Task failed under abort_phase policy, holding back queued tasks");
                }
                progress.store(index, &exec);
                drop(permit);
                exec
            };
            set.handles.push(tokio::spawn(work.in_current_span()));
        }

        // Fan-in barrier
        let mut tasks = Vec::with_capacity(phase.tasks.len());
        for (index, (task, handle)) in phase.tasks.iter().zip(set.handles.iter_mut()).enumerate() {
            let exec = match handle.await {
                Ok(exec) => exec,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Task did not run to completion");
                    let reason = if e.is_panic() {
                        "task panicked"
                    } else {
                        "task was cancelled"
                    };
                    let exec =
                        resolve_without_invocation(ctx, &phase.id, task, reason.to_string(), false);
                    progress.store(index, &exec);
                    exec
                }
            };
            tasks.push(exec);
        }
        tasks
    }

    async fn run_sequential(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        previous: &Value,
        progress: &Progress,
    ) -> Vec<TaskExecution> {
        let mut tasks: Vec<TaskExecution> = Vec::with_capacity(phase.tasks.len());
        let mut aborted_by: Option<&str> = None;

        for (index, task) in phase.tasks.iter().enumerate() {
            let exec = if let Some(aborting) = aborted_by {
                let reason = format!("phase aborted by task '{aborting}'");
                resolve_without_invocation(ctx, &phase.id, task, reason, false)
            } else {
                match dependency_payloads(task, &tasks) {
                    Ok(dependencies) => {
                        let mapped = phase.input_mapping.map(previous, task);
                        let input = if task.depends_on.is_empty() {
                            mapped
                        } else {
                            json!({"input": mapped, "dependencies": dependencies})
                        };
                        self.runner.invoke(ctx, &phase.id, task, input).await
                    }
                    Err(missing) => {
                        let reason = format!("dependency '{missing}' produced no usable output");
                        resolve_without_invocation(ctx, &phase.id, task, reason, true)
                    }
                }
            };

            if aborted_by.is_none() && aborts_phase(task, &exec) {
                warn!(task_id = %task.id, "Task failed under abort_phase policy, short-circuiting phase");
                aborted_by = Some(&task.id);
            }
            progress.store(index, &exec);
            tasks.push(exec);
        }
        tasks
    }
}

fn dependency_payloads(
    task: &TaskDefinition,
    done: &[TaskExecution],
) -> Result<Map<String, Value>, String> {
    let mut payloads = Map::new();
    for dependency in &task.depends_on {
        let payload = done
            .iter()
            .find(|exec| &exec.task_id == dependency)
            .and_then(TaskExecution::payload);
        match payload {
            Some(payload) => {
                payloads.insert(dependency.clone(), payload.clone());
            }
            None => return Err(dependency.clone()),
        }
    }
    Ok(payloads)
}

fn aborts_phase(task: &TaskDefinition, exec: &TaskExecution) -> bool {
    task.fallback_policy == FallbackPolicy::AbortPhase && !exec.status.is_usable()
}

/// First task, in declared order, whose failure aborts the phase
fn abort_trigger(phase: &PhaseDefinition, tasks: &[TaskExecution]) -> Option<String> {
    phase
        .tasks
        .iter()
        .zip(tasks)
        .find(|(task, exec)| aborts_phase(task, exec))
        .map(|(task, _)| task.id.clone())
}

fn phase_status(tasks: &[TaskExecution], aborted: bool) -> RunStatus {
    if aborted {
        RunStatus::Failed
    } else if tasks.iter().all(|t| t.status == TaskStatus::Success) {
        RunStatus::Completed
    } else if !tasks.iter().any(|t| t.status.is_usable()) {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

fn merge_payloads(tasks: &[TaskExecution]) -> Value {
    let merged: Map<String, Value> = tasks
        .iter()
        .filter_map(|t| t.payload().map(|p| (t.task_id.clone(), p.clone())))
        .collect();
    Value::Object(merged)
}

fn abandon(
    ctx: &RunContext,
    phase: &PhaseDefinition,
    slots: Vec<Option<TaskExecution>>,
) -> Vec<TaskExecution> {
    let reason = format!(
        "abandoned at hard stop: {}",
        ctx.interruption().describe()
    );
    let mut slots = slots.into_iter();
    phase
        .tasks
        .iter()
        .map(|task| match slots.next().flatten() {
            Some(exec) => exec,
            None => resolve_abandoned(ctx, &phase.id, task, reason.clone()),
        })
        .collect()
}

fn complete(
    ctx: &RunContext,
    phase: &PhaseDefinition,
    tasks: Vec<TaskExecution>,
    started: Stamp,
) -> PhaseExecution {
    let aborted_by = abort_trigger(phase, &tasks);
    let status = phase_status(&tasks, aborted_by.is_some());
    let merged_output = if aborted_by.is_some() {
        json!({})
    } else {
        merge_payloads(&tasks)
    };
    let reason = match &aborted_by {
        Some(task_id) => Some(format!("phase aborted by task '{task_id}'")),
        None if status == RunStatus::Failed => Some("no task produced a usable output".to_string()),
        None => None,
    };

    let finished = ctx.stamp();
    ctx.record(TraceEvent::PhaseCompleted {
        phase_id: phase.id.clone(),
        status,
        skipped: false,
    });

    let elapsed_ms = finished
        .instant
        .saturating_duration_since(started.instant)
        .as_millis() as u64;
    match status {
        RunStatus::Completed => info!(status = %status, elapsed_ms, "Phase completed"),
        RunStatus::Failed => error!(
            status = %status,
            elapsed_ms,
            reason = reason.as_deref().unwrap_or_default(),
            "Phase failed"
        ),
        _ => warn!(status = %status, elapsed_ms, "Phase completed with degraded output"),
    }

    PhaseExecution {
        phase_id: phase.id.clone(),
        ordinal: phase.ordinal,
        mode: phase.mode,
        status,
        tasks,
        started: Some(started),
        finished: Some(finished),
        aborted_by,
        skipped: false,
        reason,
        merged_output,
    }
}
