//! Pipeline definitions and the orchestration core
//!
//! Control flows top-down: [`PipelineExecutor`] walks the phases, the
//! [`PhaseScheduler`] fans each phase out and in, and the [`TaskRunner`]
//! owns one agent invocation with its retry envelope. Records flow back up
//! and are merged by the [`ResultAggregator`].

pub mod aggregator;
pub mod backoff;
pub mod context;
pub mod definition;
pub mod execution;
pub mod executor;
pub mod runner;
pub mod scheduler;

pub use aggregator::{PipelineResult, ResultAggregator, Section, SectionState};
pub use backoff::BackoffPolicy;
pub use context::{cancellation, CancelHandle, CancelToken, RunContext};
pub use definition::{
    Broadcast, ByTask, ExecutionMode, FallbackPolicy, Field, FnMapping, InputMapping,
    PhaseDefinition, PipelineDefinition, RunLimits, TaskDefinition,
};
pub use execution::{
    AttemptRecord, HaltReason, PhaseExecution, PipelineRun, RunFailure, RunStatus, Stamp,
    TaskExecution, TaskStatus,
};
pub use executor::{execute_pipeline, PipelineExecutor};
pub use runner::{corrective_input, TaskRunner};
pub use scheduler::PhaseScheduler;
