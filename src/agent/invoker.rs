//! Agent invocation trait and name-based dispatch

use crate::error::AgentCallError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// An external, independently owned computation service
///
/// Implementations return the agent's raw reply. They must not apply their
/// own retry policy; retries belong to the task runner.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, agent: &str, payload: Value) -> Result<String, AgentCallError>;
}

#[async_trait]
impl<T: AgentInvoker + ?Sized> AgentInvoker for Arc<T> {
    async fn invoke(&self, agent: &str, payload: Value) -> Result<String, AgentCallError> {
        (**self).invoke(agent, payload).await
    }
}

/// Routes each agent name to its invoker
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentInvoker>>,
    fallback: Option<Arc<dyn AgentInvoker>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.agents.insert(name.into(), invoker);
        self
    }

    /// Invoker used for names without an explicit registration
    pub fn with_default(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.fallback = Some(invoker);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name) || self.fallback.is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .field("has_default", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl AgentInvoker for AgentRegistry {
    async fn invoke(&self, agent: &str, payload: Value) -> Result<String, AgentCallError> {
        let invoker = self
            .agents
            .get(agent)
            .or(self.fallback.as_ref())
            .ok_or_else(|| AgentCallError::UnknownAgent(agent.to_string()))?;
        invoker.invoke(agent, payload).await
    }
}
