//! Single-task execution with timeout, retry and fallback
//!
//! [`TaskRunner::invoke`] never fails: every agent error, timeout, malformed
//! reply and cancellation is folded into the returned [`TaskExecution`].

use crate::agent::{AgentInvoker, AgentOutcome};
use crate::error::{AgentCallError, ErrorCategory};
use crate::observability::metrics;
use crate::pipeline::backoff::BackoffPolicy;
use crate::pipeline::context::RunContext;
use crate::pipeline::definition::TaskDefinition;
use crate::pipeline::execution::{AttemptRecord, TaskExecution, TaskStatus};
use crate::trace::TraceEvent;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Result of one attempt as seen by the retry loop
enum Attempt {
    Finished(AgentOutcome),
    /// The run was cancelled while the attempt was in flight
    Abandoned,
}

/// How the retry loop ended
enum Resolution {
    Succeeded(Value),
    Exhausted {
        category: ErrorCategory,
        last_error: String,
    },
    Abandoned,
}

/// Invokes one agent for one task
pub struct TaskRunner {
    invoker: Arc<dyn AgentInvoker>,
    backoff: BackoffPolicy,
}

impl TaskRunner {
    pub fn new(invoker: Arc<dyn AgentInvoker>, backoff: BackoffPolicy) -> Self {
        Self { invoker, backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `task` to a terminal status
    pub async fn invoke(
        &self,
        ctx: &RunContext,
        phase_id: &str,
        task: &TaskDefinition,
        input: Value,
    ) -> TaskExecution {
        let span = crate::task_span!(
            run_id = %ctx.run_id(),
            phase_id = %phase_id,
            task_id = %task.id,
            agent = %task.agent
        );
        self.invoke_inner(ctx, phase_id, task, input)
            .instrument(span)
            .await
    }

    async fn invoke_inner(
        &self,
        ctx: &RunContext,
        phase_id: &str,
        task: &TaskDefinition,
        input: Value,
    ) -> TaskExecution {
        if ctx.is_cancelled() {
            let reason = ctx.interruption().describe();
            return resolve_without_invocation(ctx, phase_id, task, reason, true);
        }

        let validator = match task.output_schema.as_ref().map(jsonschema::validator_for) {
            Some(Ok(validator)) => Some(validator),
            Some(Err(e)) => {
                let reason = format!("output schema does not compile: {e}");
                return resolve_without_invocation(ctx, phase_id, task, reason, true);
            }
            None => None,
        };

        let mut exec = TaskExecution::pending(&task.id, phase_id, &task.agent, task.required);
        exec.status = TaskStatus::Running;
        exec.started = Some(ctx.stamp());
        ctx.record(TraceEvent::TaskStarted {
            phase_id: phase_id.to_string(),
            task_id: task.id.clone(),
            agent: task.agent.clone(),
        });

        let max_attempts = task.max_attempts();
        let mut request = input.clone();
        let mut corrective = false;
        let mut corrected_once = false;

        let resolution = loop {
            let index = exec.attempt_count + 1;
            exec.attempt_count = index;
            metrics().task_attempt();
            debug!(attempt = index, max_attempts, corrective, "Invoking agent");

            let started = ctx.stamp();
            let attempt = self
                .attempt(ctx, task, request.clone(), validator.as_ref())
                .await;
            let duration = ctx.now().saturating_duration_since(started.instant);

            let outcome = match attempt {
                Attempt::Abandoned => {
                    exec.attempts.push(AttemptRecord {
                        index,
                        started,
                        duration,
                        category: Some(ErrorCategory::Timeout),
                        error: Some(ctx.interruption().describe()),
                        corrective,
                    });
                    break Resolution::Abandoned;
                }
                Attempt::Finished(outcome) => outcome,
            };

            let failure = match outcome {
                AgentOutcome::Success(value) => {
                    exec.attempts.push(AttemptRecord {
                        index,
                        started,
                        duration,
                        category: None,
                        error: None,
                        corrective,
                    });
                    break Resolution::Succeeded(value);
                }
                failure => failure,
            };
            let category = failure.category().unwrap_or(ErrorCategory::Fatal);
            let reason = failure.failure_reason().unwrap_or_default();

            exec.attempts.push(AttemptRecord {
                index,
                started,
                duration,
                category: Some(category),
                error: Some(reason.clone()),
                corrective,
            });

            let retry_allowed = index < max_attempts
                && match category {
                    ErrorCategory::Fatal => false,
                    ErrorCategory::Validation => !corrected_once,
                    ErrorCategory::Transient | ErrorCategory::Timeout => true,
                };
            let delay = self.backoff.delay(index - 1, category);

            let Some(delay) = delay.filter(|_| retry_allowed) else {
                break Resolution::Exhausted {
                    category,
                    last_error: reason,
                };
            };

            warn!(
                attempt = index,
                category = %category,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Task attempt failed, retrying"
            );

            if !self.pause(ctx, delay).await {
                break Resolution::Abandoned;
            }

            if category == ErrorCategory::Validation {
                request = corrective_input(&input, &reason);
                corrective = true;
                corrected_once = true;
            } else {
                request = input.clone();
                corrective = false;
            }

            metrics().task_retried();
            ctx.record(TraceEvent::TaskRetried {
                phase_id: phase_id.to_string(),
                task_id: task.id.clone(),
                attempt: index + 1,
                previous_category: category,
                delay,
                corrective,
            });
        };

        self.finish(ctx, task, exec, resolution)
    }

    /// One agent call, raced against the attempt timeout and cancellation
    async fn attempt(
        &self,
        ctx: &RunContext,
        task: &TaskDefinition,
        request: Value,
        validator: Option<&jsonschema::Validator>,
    ) -> Attempt {
        let cancel = ctx.cancel_token();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Attempt::Abandoned,
            result = self.invoker.invoke(&task.agent, request) => {
                Attempt::Finished(AgentOutcome::from_result(result).conform(validator))
            }
            _ = ctx.clock().sleep(task.timeout) => {
                Attempt::Finished(AgentOutcome::AgentError(AgentCallError::Timeout(format!(
                    "attempt exceeded {} ms",
                    task.timeout.as_millis()
                ))))
            }
        }
    }

    /// Backoff sleep; returns `false` if the run was cancelled meanwhile
    async fn pause(&self, ctx: &RunContext, delay: Duration) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        let cancel = ctx.cancel_token();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = ctx.clock().sleep(delay) => true,
        }
    }

    fn finish(
        &self,
        ctx: &RunContext,
        task: &TaskDefinition,
        mut exec: TaskExecution,
        resolution: Resolution,
    ) -> TaskExecution {
        let attempts = exec.attempt_count;
        match resolution {
            Resolution::Succeeded(value) => {
                exec.status = TaskStatus::Success;
                exec.output = Some(value);
                info!(attempts, "Task succeeded");
            }
            Resolution::Exhausted {
                category,
                last_error,
            } => {
                let reason = exhaustion_reason(category, attempts, &last_error);
                apply_fallback_policy(&mut exec, task, reason, TaskStatus::Failed);
            }
            Resolution::Abandoned => {
                let reason = format!(
                    "abandoned after {}: {}",
                    attempts_phrase(attempts),
                    ctx.interruption().describe()
                );
                apply_fallback_policy(&mut exec, task, reason, TaskStatus::Timeout);
            }
        }

        exec.finished = Some(ctx.stamp());
        record_resolution(ctx, &exec);
        exec
    }
}

/// Resolve a task without calling its agent
///
/// Used for halted phases, unmet dependencies and aborted sequential phases.
/// With `allow_fallback` unset the task is FAILED even if a fallback exists.
pub fn resolve_without_invocation(
    ctx: &RunContext,
    phase_id: &str,
    task: &TaskDefinition,
    reason: String,
    allow_fallback: bool,
) -> TaskExecution {
    let mut exec = TaskExecution::pending(&task.id, phase_id, &task.agent, task.required);
    let now = ctx.stamp();
    exec.started = Some(now);

    if allow_fallback {
        apply_fallback_policy(&mut exec, task, reason, TaskStatus::Failed);
    } else {
        warn!(task_id = %task.id, reason = %reason, "Task not invoked");
        exec.status = TaskStatus::Failed;
        exec.reason = Some(reason);
    }

    exec.finished = Some(now);
    record_resolution(ctx, &exec);
    exec
}

/// Resolve a task whose in-flight work was dropped at the hard stop
pub(crate) fn resolve_abandoned(
    ctx: &RunContext,
    phase_id: &str,
    task: &TaskDefinition,
    reason: String,
) -> TaskExecution {
    let mut exec = TaskExecution::pending(&task.id, phase_id, &task.agent, task.required);
    let now = ctx.stamp();
    exec.started = Some(now);
    apply_fallback_policy(&mut exec, task, reason, TaskStatus::Timeout);
    exec.finished = Some(now);
    match record_resolution(ctx, &exec) {
        Some(earlier) => resolved_elsewhere(exec, task, &earlier),
        None => exec,
    }
}

/// Rebuild a record from a resolution that reached the trace first
///
/// Only the trace survives such a race, so an agent reply is not recovered.
fn resolved_elsewhere(
    mut exec: TaskExecution,
    task: &TaskDefinition,
    earlier: &TraceEvent,
) -> TaskExecution {
    debug!(task_id = %task.id, "Task resolved concurrently with the hard stop");
    match earlier {
        TraceEvent::TaskFellBack {
            attempts, reason, ..
        } => {
            exec.status = TaskStatus::Fallback;
            exec.attempt_count = *attempts;
            exec.output = task.usable_fallback().cloned();
            exec.reason = Some(reason.clone());
        }
        TraceEvent::TaskCompleted {
            status,
            attempts,
            reason,
            ..
        } => {
            exec.status = *status;
            exec.attempt_count = *attempts;
            exec.output = None;
            exec.reason = reason.clone();
        }
        _ => {}
    }
    exec
}

fn apply_fallback_policy(
    exec: &mut TaskExecution,
    task: &TaskDefinition,
    reason: String,
    otherwise: TaskStatus,
) {
    match task.usable_fallback() {
        Some(payload) => {
            warn!(task_id = %task.id, reason = %reason, "Task fell back to static payload");
            exec.status = TaskStatus::Fallback;
            exec.output = Some(payload.clone());
        }
        None => {
            error!(task_id = %task.id, status = %otherwise, reason = %reason, "Task failed");
            exec.status = otherwise;
        }
    }
    exec.reason = Some(reason);
}

/// Append the terminal event; returns the one already on record if the task was resolved first
fn record_resolution(ctx: &RunContext, exec: &TaskExecution) -> Option<TraceEvent> {
    let event = if exec.status == TaskStatus::Fallback {
        TraceEvent::TaskFellBack {
            phase_id: exec.phase_id.clone(),
            task_id: exec.task_id.clone(),
            attempts: exec.attempt_count,
            reason: exec.reason.clone().unwrap_or_default(),
        }
    } else {
        TraceEvent::TaskCompleted {
            phase_id: exec.phase_id.clone(),
            task_id: exec.task_id.clone(),
            status: exec.status,
            attempts: exec.attempt_count,
            reason: exec.reason.clone(),
        }
    };
    match ctx.trace().append_resolution(event) {
        Ok(_) => {
            metrics().task_resolved(exec.status);
            None
        }
        Err(earlier) => Some(earlier),
    }
}

/// Input for the single retry after a validation failure
pub fn corrective_input(original: &Value, previous_error: &str) -> Value {
    json!({
        "input": original,
        "correction": {"previous_error": previous_error},
    })
}

fn attempts_phrase(attempts: u32) -> String {
    if attempts == 1 {
        "1 attempt".to_string()
    } else {
        format!("{attempts} attempts")
    }
}

fn exhaustion_reason(category: ErrorCategory, attempts: u32, last_error: &str) -> String {
    let attempts = attempts_phrase(attempts);
    match category {
        ErrorCategory::Timeout => format!("timed out after {attempts}"),
        ErrorCategory::Transient => format!("transient failure after {attempts}: {last_error}"),
        ErrorCategory::Validation => format!("invalid output after {attempts}: {last_error}"),
        ErrorCategory::Fatal => format!("fatal error after {attempts}: {last_error}"),
    }
}
