//! Agent Orchestrator - multi-phase agent pipelines
//!
//! Runs a fixed, ordered pipeline of remote agent invocations and assembles
//! their outputs into one composite result.
//!
//! # Overview
//!
//! - Phases run strictly in order; each one is parallel or sequential
//! - Every task has a per-attempt timeout, bounded retries with backoff, and
//!   an optional static fallback payload
//! - A global deadline bounds each run; in-flight attempts are cancelled
//!   cooperatively once it passes
//! - Every lifecycle transition lands in an append-only trace, summarized
//!   per task and per phase
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use agent_orchestrator::agent::HttpAgentInvoker;
//! use agent_orchestrator::pipeline::{
//!     execute_pipeline, PhaseDefinition, PipelineDefinition, TaskDefinition,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = PipelineDefinition::new("daily-bundle")
//!     .with_deadline(Duration::from_secs(120))
//!     .with_phase(
//!         PhaseDefinition::parallel("research")
//!             .with_task(
//!                 TaskDefinition::new("headlines", "news-agent")
//!                     .with_fallback(json!({"text": "No headlines available"})),
//!             )
//!             .with_task(TaskDefinition::new("weather", "weather-agent")),
//!     )
//!     .with_phase(
//!         PhaseDefinition::sequential("write").with_task(TaskDefinition::new("draft", "writer")),
//!     );
//!
//! let invoker = HttpAgentInvoker::new("http://localhost:8700", Duration::from_secs(60))?;
//! let result = execute_pipeline(definition, Arc::new(invoker), json!({"city": "Oslo"})).await?;
//!
//! for section in &result.sections {
//!     println!("{}: {:?} (fallback: {})", section.id, section.state, section.used_fallback);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod testing;
pub mod trace;

pub use agent::{AgentInvoker, AgentOutcome, AgentRegistry, HttpAgentInvoker};
pub use clock::{Clock, TokioClock};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{AgentCallError, ErrorCategory, OrchestratorError, OrchestratorResult};
pub use pipeline::{
    execute_pipeline, PipelineDefinition, PipelineExecutor, PipelineResult, PipelineRun,
    RunStatus, TaskStatus,
};
pub use trace::{TraceCollector, TraceSummary};
