//! Top-level run coordination
//!
//! [`PipelineExecutor::run`] walks the phases strictly in order, checks the
//! global deadline before each one, and turns whatever happened into a
//! terminal [`PipelineRun`]. A watcher task raises the run's cancellation
//! signal when the deadline passes or the caller cancels; in-flight attempts
//! observe it and are abandoned.

use crate::agent::AgentInvoker;
use crate::clock::{instant_after, Clock, TokioClock};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::observability::metrics;
use crate::pipeline::aggregator::{PipelineResult, ResultAggregator};
use crate::pipeline::backoff::BackoffPolicy;
use crate::pipeline::context::{cancellation, CancelHandle, CancelToken, RunContext};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::execution::{HaltReason, PipelineRun, RunFailure, RunStatus};
use crate::pipeline::runner::TaskRunner;
use crate::pipeline::scheduler::PhaseScheduler;
use crate::trace::{TraceCollector, TraceEvent, TraceReport, TraceSink};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Runs one validated pipeline definition
pub struct PipelineExecutor {
    definition: Arc<PipelineDefinition>,
    invoker: Arc<dyn AgentInvoker>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    sinks: Vec<Arc<dyn TraceSink>>,
    cancel: CancelHandle,
    aggregator: ResultAggregator,
}

impl PipelineExecutor {
    /// Validate `definition` and build an executor for it
    pub fn new(
        definition: PipelineDefinition,
        invoker: Arc<dyn AgentInvoker>,
    ) -> OrchestratorResult<Self> {
        definition.validate()?;
        let (cancel, _) = cancellation();
        Ok(Self {
            definition: Arc::new(definition),
            invoker,
            backoff: BackoffPolicy::default(),
            clock: Arc::new(TokioClock),
            sinks: Vec::new(),
            cancel,
            aggregator: ResultAggregator::new(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish every finished run's trace to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Handle that cancels the current run
    ///
    /// Cancellation is sticky: runs started after it is raised halt before
    /// their first phase.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute the pipeline; always returns a terminal run
    pub async fn run(&self, initial_input: Value) -> PipelineRun {
        let run_id = Uuid::new_v4();
        let span = crate::run_span!(run_id = %run_id, pipeline = %self.definition.name);
        self.run_inner(run_id, initial_input).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, initial_input: Value) -> PipelineRun {
        let limits = self.definition.limits;
        let trace = Arc::new(TraceCollector::new(run_id, self.clock.clone()));
        let deadline = instant_after(trace.origin(), limits.deadline);

        let (internal, token) = cancellation();
        if self.cancel.is_cancelled() {
            internal.cancel();
        }
        let watcher = spawn_watcher(
            self.clock.clone(),
            deadline,
            self.cancel.token(),
            internal.clone(),
        );
        let ctx = RunContext::new(self.clock.clone(), trace.clone(), deadline, token);

        metrics().run_started();
        let mut run = PipelineRun::new(run_id, &self.definition.name, ctx.stamp(), trace.clone());
        run.status = RunStatus::Running;
        ctx.record(TraceEvent::PipelineStarted {
            pipeline: self.definition.name.clone(),
            phases: self.definition.phases.len(),
        });
        info!(
            phases = self.definition.phases.len(),
            tasks = self.definition.task_count(),
            deadline_ms = u64::try_from(limits.deadline.as_millis()).unwrap_or(u64::MAX),
            "Pipeline run started"
        );

        let runner = TaskRunner::new(self.invoker.clone(), self.backoff.clone());
        let scheduler = PhaseScheduler::new(Arc::new(runner), limits.cancellation_grace);
        let mut previous = initial_input;

        for phase in &self.definition.phases {
            if run.halted.is_none() {
                run.halted = self.halt_check(&ctx);
            }

            let exec = match &run.halted {
                Some(halt) => scheduler.skip_phase(&ctx, phase, halt),
                None => {
                    let exec = scheduler.run_phase(&ctx, phase, &previous).await;
                    // A phase starved by the deadline is degraded, not a run failure
                    if exec.is_catastrophic() && !ctx.is_cancelled() {
                        let reason = format!(
                            "phase '{}' produced no usable output from its required tasks",
                            exec.phase_id
                        );
                        error!(phase_id = %exec.phase_id, reason = %reason, "Required phase failed");
                        run.failure = Some(RunFailure {
                            phase_id: exec.phase_id.clone(),
                            reason,
                        });
                        run.halted = Some(HaltReason::UpstreamFailed {
                            phase_id: exec.phase_id.clone(),
                        });
                    }
                    previous = exec.merged_output.clone();
                    exec
                }
            };
            run.phases.push(exec);
        }

        run.status = run_status(&run);
        run.finished = Some(ctx.stamp());
        run.result = Some(self.aggregator.finalize(&run));
        ctx.record(TraceEvent::PipelineCompleted { status: run.status });
        trace.seal();
        watcher.abort();

        let duration = run.duration();
        metrics().run_finished(run.status, duration);
        let elapsed_ms = duration.as_millis() as u64;
        match run.status {
            RunStatus::Completed => info!(status = %run.status, elapsed_ms, "Pipeline run completed"),
            RunStatus::Failed => error!(
                status = %run.status,
                elapsed_ms,
                reason = run.failure.as_ref().map(|f| f.reason.as_str()).unwrap_or_default(),
                "Pipeline run failed"
            ),
            _ => warn!(
                status = %run.status,
                elapsed_ms,
                halted = run.halted.as_ref().map(HaltReason::describe).unwrap_or_default(),
                "Pipeline run completed with degraded output"
            ),
        }

        self.publish(&trace).await;
        run
    }

    /// Why no further phase may start, if any
    fn halt_check(&self, ctx: &RunContext) -> Option<HaltReason> {
        if ctx.is_cancelled() || self.cancel.is_cancelled() {
            return Some(ctx.interruption());
        }
        let remaining = ctx.remaining();
        if remaining.is_zero() || remaining < self.definition.limits.min_phase_budget {
            warn!(
                remaining_ms = remaining.as_millis() as u64,
                "Insufficient budget left to start another phase"
            );
            return Some(HaltReason::DeadlineExceeded);
        }
        None
    }

    async fn publish(&self, trace: &TraceCollector) {
        if self.sinks.is_empty() {
            return;
        }
        let report = TraceReport::from_collector(&self.definition.name, trace);
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&report).await {
                warn!(run_id = %report.run_id, error = %e, "Failed to publish run trace");
            }
        }
    }
}

impl fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("pipeline", &self.definition.name)
            .field("phases", &self.definition.phases.len())
            .field("backoff", &self.backoff)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Raise the run's cancellation at the deadline or on caller cancellation
fn spawn_watcher(
    clock: Arc<dyn Clock>,
    deadline: Instant,
    external: CancelToken,
    internal: CancelHandle,
) -> JoinHandle<()> {
    let work = async move {
        let wait = deadline.saturating_duration_since(clock.now());
        tokio::select! {
            _ = clock.sleep(wait) => {
                warn!("Pipeline deadline reached, cancelling in-flight attempts");
            }
            _ = external.cancelled() => {
                warn!("Pipeline run cancelled by caller");
            }
        }
        internal.cancel();
    };
    tokio::spawn(work.in_current_span())
}

fn run_status(run: &PipelineRun) -> RunStatus {
    if run.failure.is_some() {
        RunStatus::Failed
    } else if run.phases.iter().all(|p| p.status == RunStatus::Completed) {
        RunStatus::Completed
    } else {
        RunStatus::Partial
    }
}

/// Run `definition` once against `invoker` and return its aggregated result
pub async fn execute_pipeline(
    definition: PipelineDefinition,
    invoker: Arc<dyn AgentInvoker>,
    initial_input: Value,
) -> OrchestratorResult<PipelineResult> {
    let executor = PipelineExecutor::new(definition, invoker)?;
    executor
        .run(initial_input)
        .await
        .result
        .ok_or_else(|| OrchestratorError::internal_error("run finished without a result"))
}
