//! TOML configuration for pipelines and runtime settings
//!
//! A configuration file describes one pipeline: its run limits, the retry
//! backoff, where agents are reached, and the ordered `[[phases]]` with their
//! `[[phases.tasks]]`. Loading parses and validates; the result is turned into
//! a [`PipelineDefinition`] with [`OrchestratorConfig::to_definition`].

use crate::agent::{AgentRegistry, HttpAgentInvoker};
use crate::error::OrchestratorResult;
use crate::pipeline::backoff::BackoffPolicy;
use crate::pipeline::definition::{
    Broadcast, ByTask, ExecutionMode, FallbackPolicy, Field, PhaseDefinition, PipelineDefinition,
    RunLimits, TaskDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Environment variable overriding `[agents].base_url`
pub const AGENT_URL_ENV: &str = "ORCHESTRATOR_AGENT_URL";

/// Whole configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

/// `[pipeline]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    pub name: String,
    /// Global pipeline deadline
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,
    /// Budget required to start a phase; 0 means any positive budget
    #[serde(default)]
    pub min_phase_budget_ms: u64,
}

fn default_deadline_ms() -> u64 {
    120_000
}

fn default_cancellation_grace_ms() -> u64 {
    2_000
}

/// `[backoff]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub transient_multiplier: f64,
    #[serde(default = "default_multiplier")]
    pub timeout_multiplier: f64,
    #[serde(default)]
    pub validation_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            transient_multiplier: default_multiplier(),
            timeout_multiplier: default_multiplier(),
            validation_delay_ms: 0,
        }
    }
}

impl BackoffSection {
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            transient_multiplier: self.transient_multiplier,
            timeout_multiplier: self.timeout_multiplier,
            validation_delay: Duration::from_millis(self.validation_delay_ms),
        }
    }
}

/// `[agents]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentsSection {
    /// Base URL of the HTTP agent service
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-agent base URLs, taking precedence over `base_url`
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: default_request_timeout_ms(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl AgentsSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether any agent can be reached at all
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() || !self.endpoints.is_empty()
    }

    /// One HTTP invoker per `endpoints` entry, with `base_url` serving every other agent
    pub fn registry(&self) -> OrchestratorResult<AgentRegistry> {
        let timeout = self.request_timeout();
        let mut registry = AgentRegistry::new();
        for (agent, url) in &self.endpoints {
            let invoker = HttpAgentInvoker::new(url, timeout)?;
            registry = registry.register(agent.clone(), Arc::new(invoker));
        }
        if let Some(base_url) = &self.base_url {
            registry = registry.with_default(Arc::new(HttpAgentInvoker::new(base_url, timeout)?));
        }
        Ok(registry)
    }
}

/// Built-in input mapping selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSelector {
    #[default]
    Broadcast,
    ByTask,
    /// Requires the phase's `field` key
    Field,
}

/// One `[[phases]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseConfig {
    pub id: String,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub input: InputSelector,
    /// Key read from the previous output when `input = "field"`
    pub field: Option<String>,
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// One `[[phases.tasks]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub id: String,
    pub agent: String,
    #[serde(default = "default_task_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    pub fallback: Option<Value>,
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_required() -> bool {
    true
}

impl TaskConfig {
    fn to_definition(&self) -> TaskDefinition {
        let mut task = TaskDefinition::new(&self.id, &self.agent)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_retries(self.max_retries)
            .with_fallback_policy(self.fallback_policy)
            .depends_on(self.depends_on.iter().cloned());
        if let Some(fallback) = &self.fallback {
            task = task.with_fallback(fallback.clone());
        }
        if let Some(schema) = &self.output_schema {
            task = task.with_output_schema(schema.clone());
        }
        if !self.required {
            task = task.optional();
        }
        task
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OrchestratorConfig {
    /// Load, apply environment overrides, and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            pipeline = %config.pipeline.name,
            phases = config.phases.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse TOML without validating
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(AGENT_URL_ENV) {
            self.override_agent_url(url);
        }
    }

    /// Replace `[agents].base_url`; blank values are ignored
    pub fn override_agent_url(&mut self, url: String) {
        if !url.trim().is_empty() {
            self.agents.base_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.factor.is_nan() || self.backoff.factor < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "backoff factor must be at least 1.0, got {}",
                self.backoff.factor
            )));
        }
        if self.backoff.transient_multiplier < 0.0 || self.backoff.timeout_multiplier < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "backoff multipliers must not be negative".to_string(),
            ));
        }

        for phase in &self.phases {
            if phase.input == InputSelector::Field && phase.field.is_none() {
                return Err(ConfigError::InvalidConfig(format!(
                    "phase '{}' uses input = \"field\" without a field key",
                    phase.id
                )));
            }
            if phase.max_concurrency == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "phase '{}' max_concurrency must be at least 1",
                    phase.id
                )));
            }
            for task in &phase.tasks {
                if task.fallback_policy == FallbackPolicy::AbortPhase && task.fallback.is_some() {
                    warn!(
                        task_id = %task.id,
                        "Fallback payload is ignored for tasks with fallback_policy = \"abort_phase\""
                    );
                }
            }
        }

        self.to_definition()?
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Build the pipeline definition described by this configuration
    pub fn to_definition(&self) -> Result<PipelineDefinition, ConfigError> {
        let mut definition = PipelineDefinition::new(&self.pipeline.name).with_limits(RunLimits {
            deadline: Duration::from_millis(self.pipeline.deadline_ms),
            cancellation_grace: Duration::from_millis(self.pipeline.cancellation_grace_ms),
            min_phase_budget: Duration::from_millis(self.pipeline.min_phase_budget_ms),
        });

        for phase_config in &self.phases {
            let mut phase = PhaseDefinition::new(&phase_config.id, phase_config.mode);
            phase = match (phase_config.input, &phase_config.field) {
                (InputSelector::Broadcast, _) => phase.with_input_mapping(Broadcast),
                (InputSelector::ByTask, _) => phase.with_input_mapping(ByTask),
                (InputSelector::Field, Some(key)) => phase.with_input_mapping(Field(key.clone())),
                (InputSelector::Field, None) => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "phase '{}' uses input = \"field\" without a field key",
                        phase_config.id
                    )))
                }
            };
            if let Some(limit) = phase_config.max_concurrency {
                phase = phase.with_max_concurrency(limit);
            }
            for task in &phase_config.tasks {
                phase = phase.with_task(task.to_definition());
            }
            definition = definition.with_phase(phase);
        }

        Ok(definition)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff.to_policy()
    }
}
