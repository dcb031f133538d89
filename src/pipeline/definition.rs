//! Static pipeline descriptors
//!
//! A [`PipelineDefinition`] is built once (from configuration or code),
//! validated, and then shared immutably by every run. Phase-to-phase data
//! flow is explicit: each phase owns an [`InputMapping`] that derives a
//! task's input from the previous phase's merged output and nothing else.

use crate::error::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 2;

/// How the tasks of one phase are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Parallel => f.write_str("parallel"),
            ExecutionMode::Sequential => f.write_str("sequential"),
        }
    }
}

/// What happens when a task exhausts its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Substitute the static fallback payload, if one is configured
    #[default]
    ContinueWithFallback,
    /// Fail the whole phase
    AbortPhase,
}

/// One unit of work: a single agent invocation with its retry envelope
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub id: String,
    /// Opaque handle passed to the agent invoker
    pub agent: String,
    /// Hard per-attempt timeout
    pub timeout: Duration,
    pub max_retries: u32,
    pub fallback_policy: FallbackPolicy,
    pub fallback: Option<Value>,
    /// JSON Schema the agent's output must satisfy
    pub output_schema: Option<Value>,
    /// Earlier tasks of the same sequential phase whose outputs this task reads
    pub depends_on: Vec<String>,
    /// Whether the phase needs this task's output to be considered usable
    pub required: bool,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            timeout: DEFAULT_TASK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            fallback_policy: FallbackPolicy::default(),
            fallback: None,
            output_schema: None,
            depends_on: Vec::new(),
            required: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_fallback(mut self, payload: Value) -> Self {
        self.fallback = Some(payload);
        self
    }

    pub fn with_fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback_policy = policy;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn depends_on<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = task_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Upper bound on attempts: `max_retries + 1`
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// The payload substituted on exhaustion, if the policy allows one
    pub fn usable_fallback(&self) -> Option<&Value> {
        match self.fallback_policy {
            FallbackPolicy::ContinueWithFallback => self.fallback.as_ref(),
            FallbackPolicy::AbortPhase => None,
        }
    }
}

/// Pure function from the previous phase's merged output to one task's input
pub trait InputMapping: Send + Sync {
    fn map(&self, previous: &Value, task: &TaskDefinition) -> Value;

    /// Short label used in logs and `validate --show`
    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// Every task receives the whole previous output
#[derive(Debug, Default, Clone, Copy)]
pub struct Broadcast;

impl InputMapping for Broadcast {
    fn map(&self, previous: &Value, _task: &TaskDefinition) -> Value {
        previous.clone()
    }

    fn describe(&self) -> String {
        "broadcast".to_string()
    }
}

/// Each task receives `previous[task.id]`, or `null` when absent
#[derive(Debug, Default, Clone, Copy)]
pub struct ByTask;

impl InputMapping for ByTask {
    fn map(&self, previous: &Value, task: &TaskDefinition) -> Value {
        previous.get(&task.id).cloned().unwrap_or(Value::Null)
    }

    fn describe(&self) -> String {
        "by_task".to_string()
    }
}

/// Every task receives `previous[field]`, or `null` when absent
#[derive(Debug, Clone)]
pub struct Field(pub String);

impl InputMapping for Field {
    fn map(&self, previous: &Value, _task: &TaskDefinition) -> Value {
        previous.get(&self.0).cloned().unwrap_or(Value::Null)
    }

    fn describe(&self) -> String {
        format!("field:{}", self.0)
    }
}

/// Adapter turning a closure into an [`InputMapping`]
pub struct FnMapping<F>(pub F);

impl<F> InputMapping for FnMapping<F>
where
    F: Fn(&Value, &TaskDefinition) -> Value + Send + Sync,
{
    fn map(&self, previous: &Value, task: &TaskDefinition) -> Value {
        (self.0)(previous, task)
    }
}

/// One ordered pipeline stage
#[derive(Clone)]
pub struct PhaseDefinition {
    pub id: String,
    /// Position in the pipeline, assigned when the phase is added
    pub ordinal: usize,
    pub mode: ExecutionMode,
    pub tasks: Vec<TaskDefinition>,
    pub input_mapping: Arc<dyn InputMapping>,
    /// Bound on simultaneously running tasks in parallel mode
    pub max_concurrency: Option<usize>,
}

impl PhaseDefinition {
    pub fn new(id: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            ordinal: 0,
            mode,
            tasks: Vec::new(),
            input_mapping: Arc::new(Broadcast),
            max_concurrency: None,
        }
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, ExecutionMode::Parallel)
    }

    pub fn sequential(id: impl Into<String>) -> Self {
        Self::new(id, ExecutionMode::Sequential)
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_input_mapping(mut self, mapping: impl InputMapping + 'static) -> Self {
        self.input_mapping = Arc::new(mapping);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

impl fmt::Debug for PhaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDefinition")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("mode", &self.mode)
            .field("tasks", &self.tasks)
            .field("input_mapping", &self.input_mapping.describe())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Run-level time limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Global pipeline deadline measured from run start
    pub deadline: Duration,
    /// Extra time allowed for in-flight attempts to observe cancellation
    pub cancellation_grace: Duration,
    /// Remaining budget required before a phase is started
    pub min_phase_budget: Duration,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            cancellation_grace: Duration::from_secs(2),
            min_phase_budget: Duration::ZERO,
        }
    }
}

/// Ordered, immutable list of phases
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub phases: Vec<PhaseDefinition>,
    pub limits: RunLimits,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
            limits: RunLimits::default(),
        }
    }

    /// Append a phase; its ordinal becomes its position
    pub fn with_phase(mut self, mut phase: PhaseDefinition) -> Self {
        phase.ordinal = self.phases.len();
        self.phases.push(phase);
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.limits.deadline = deadline;
        self
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// Check structural invariants before any run uses this definition
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.phases.is_empty() {
            return Err(OrchestratorError::invalid_definition(
                "pipeline must contain at least one phase",
            ));
        }
        if self.limits.deadline.is_zero() {
            return Err(OrchestratorError::invalid_definition(
                "pipeline deadline must be greater than zero",
            ));
        }

        let mut phase_ids = HashSet::new();
        let mut task_ids = HashSet::new();

        for (position, phase) in self.phases.iter().enumerate() {
            validate_identifier("phase", &phase.id)?;
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(OrchestratorError::invalid_definition(format!(
                    "duplicate phase id '{}'",
                    phase.id
                )));
            }
            if phase.ordinal != position {
                return Err(OrchestratorError::invalid_definition(format!(
                    "phase '{}' has ordinal {} but is at position {position}",
                    phase.id, phase.ordinal
                )));
            }
            if phase.tasks.is_empty() {
                return Err(OrchestratorError::invalid_definition(format!(
                    "phase '{}' has no tasks",
                    phase.id
                )));
            }

            let mut earlier_in_phase: HashSet<&str> = HashSet::new();
            for task in &phase.tasks {
                validate_task(task)?;
                if !task_ids.insert(task.id.as_str()) {
                    return Err(OrchestratorError::invalid_definition(format!(
                        "duplicate task id '{}'",
                        task.id
                    )));
                }
                if !task.depends_on.is_empty() && phase.mode == ExecutionMode::Parallel {
                    return Err(OrchestratorError::invalid_definition(format!(
                        "task '{}' declares dependencies inside parallel phase '{}'",
                        task.id, phase.id
                    )));
                }
                for dependency in &task.depends_on {
                    if !earlier_in_phase.contains(dependency.as_str()) {
                        return Err(OrchestratorError::invalid_definition(format!(
                            "task '{}' depends on '{dependency}', which is not an earlier task of phase '{}'",
                            task.id, phase.id
                        )));
                    }
                }
                earlier_in_phase.insert(task.id.as_str());
            }
        }

        Ok(())
    }
}

fn validate_task(task: &TaskDefinition) -> OrchestratorResult<()> {
    validate_identifier("task", &task.id)?;
    if task.agent.trim().is_empty() {
        return Err(OrchestratorError::invalid_definition(format!(
            "task '{}' has an empty agent name",
            task.id
        )));
    }
    if task.timeout.is_zero() {
        return Err(OrchestratorError::invalid_definition(format!(
            "task '{}' timeout must be greater than zero",
            task.id
        )));
    }
    if let Some(schema) = &task.output_schema {
        jsonschema::validator_for(schema).map_err(|e| {
            OrchestratorError::invalid_definition(format!(
                "task '{}' output schema does not compile: {e}",
                task.id
            ))
        })?;
    }
    Ok(())
}

/// Identifiers must match `[a-zA-Z0-9._-]+`
pub fn validate_identifier(kind: &str, id: &str) -> OrchestratorResult<()> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(OrchestratorError::invalid_definition(format!(
            "{kind} id '{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }
    Ok(())
}
