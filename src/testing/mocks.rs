//! Mock agent invoker for testing

use crate::agent::AgentInvoker;
use crate::error::AgentCallError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted reaction to an invocation
#[derive(Debug, Clone)]
pub enum Step {
    /// Reply with this JSON payload
    Reply(Value),
    /// Reply with raw text, which need not be JSON
    Raw(String),
    Fail(AgentCallError),
    /// Never reply
    Hang,
    /// Wait, then perform the inner step
    Delay(Duration, Box<Step>),
}

impl Step {
    pub fn reply(value: Value) -> Self {
        Step::Reply(value)
    }

    pub fn fail(error: AgentCallError) -> Self {
        Step::Fail(error)
    }

    pub fn delayed(delay: Duration, step: Step) -> Self {
        Step::Delay(delay, Box::new(step))
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
}

impl Script {
    /// Next step; the last one repeats forever
    fn next(&mut self) -> Option<Step> {
        if self.steps.len() > 1 {
            self.steps.pop_front()
        } else {
            self.steps.front().cloned()
        }
    }
}

/// A recorded invocation
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub agent: String,
    pub payload: Value,
    pub at: Instant,
}

/// Agent invoker driven by per-agent step scripts
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<String, Script>>,
    default_step: Option<Step>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the replies of `agent`
    pub fn script<I>(self, agent: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = Step>,
    {
        lock(&self.scripts).insert(
            agent.into(),
            Script {
                steps: steps.into_iter().collect(),
            },
        );
        self
    }

    /// Step used for agents without a script
    pub fn with_default(mut self, step: Step) -> Self {
        self.default_step = Some(step);
        self
    }

    pub fn calls(&self, agent: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.agent == agent).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn inputs(&self, agent: &str) -> Vec<Value> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.agent == agent)
            .map(|c| c.payload.clone())
            .collect()
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Highest number of simultaneous invocations observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, agent: &str) -> Option<Step> {
        lock(&self.scripts)
            .get_mut(agent)
            .and_then(Script::next)
            .or_else(|| self.default_step.clone())
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(&self, agent: &str, payload: Value) -> Result<String, AgentCallError> {
        lock(&self.calls).push(RecordedCall {
            agent: agent.to_string(),
            payload,
            at: Instant::now(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let mut step = self
            .next_step(agent)
            .ok_or_else(|| AgentCallError::UnknownAgent(agent.to_string()))?;

        loop {
            match step {
                Step::Reply(value) => return Ok(value.to_string()),
                Step::Raw(raw) => return Ok(raw),
                Step::Fail(error) => return Err(error),
                Step::Hang => std::future::pending::<()>().await,
                Step::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_last_step_repeats() {
        let agent = ScriptedAgent::new().script(
            "news",
            [
                Step::fail(AgentCallError::Network("reset".into())),
                Step::reply(json!({"n": 1})),
            ],
        );

        assert!(agent.invoke("news", json!(1)).await.is_err());
        assert_eq!(agent.invoke("news", json!(2)).await.unwrap(), r#"{"n":1}"#);
        assert_eq!(agent.invoke("news", json!(3)).await.unwrap(), r#"{"n":1}"#);
        assert_eq!(agent.calls("news"), 3);
        assert_eq!(agent.inputs("news"), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_unscripted_agent_is_unknown_without_default() {
        let agent = ScriptedAgent::new();
        let error = agent.invoke("ghost", json!({})).await.unwrap_err();
        assert_eq!(error, AgentCallError::UnknownAgent("ghost".into()));

        let agent = ScriptedAgent::new().with_default(Step::Raw("ok".into()));
        assert_eq!(agent.invoke("ghost", json!({})).await.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_step_waits_before_inner_step() {
        let agent = ScriptedAgent::new().script(
            "slow",
            [Step::delayed(Duration::from_millis(250), Step::reply(json!("done")))],
        );

        let started = Instant::now();
        let reply = agent.invoke("slow", json!({})).await.unwrap();

        assert_eq!(reply, r#""done""#);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_tracking() {
        let agent = std::sync::Arc::new(ScriptedAgent::new().with_default(Step::delayed(
            Duration::from_millis(10),
            Step::reply(json!({})),
        )));

        let calls = (0..3).map(|_| {
            let agent = agent.clone();
            tokio::spawn(async move { agent.invoke("any", json!({})).await })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }

        assert_eq!(agent.max_in_flight(), 3);
        assert_eq!(agent.total_calls(), 3);
    }
}
