//! End-to-end pipeline scenarios against scripted agents
//!
//! Covers the healthy path, a degraded task resolved by its fallback, and a
//! deadline that expires mid-pipeline.


use agent_orchestrator::pipeline::{
    BackoffPolicy, FallbackPolicy, HaltReason, PhaseDefinition, PipelineDefinition,
    PipelineExecutor, RunLimits, RunStatus, SectionState, TaskDefinition, TaskStatus,
};
use agent_orchestrator::testing::{ScriptedAgent, Step};
use agent_orchestrator::AgentCallError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

#[tokio::test(start_paused = true)]
async fn test_healthy_bundle_completes_without_retries() {
    let agent = Arc::new(healthy_agents());
    let executor = PipelineExecutor::new(daily_bundle(), agent.clone()).unwrap();

    let run = executor.run(json!({"city": "Oslo"})).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_retries(), 0);
    assert!(run.failure.is_none());
    assert!(run.halted.is_none());

    let result = run.result.clone().unwrap();
    let ids: Vec<&str> = result.sections.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["headlines", "weather", "draft", "summary", "audio_script"]);
    assert!(result
        .sections
        .iter()
        .all(|s| s.state == SectionState::Resolved && !s.used_fallback));

    assert_eq!(agent.inputs("news-agent"), vec![json!({"city": "Oslo"})]);
    assert_eq!(
        agent.inputs("writer"),
        vec![json!({
            "headlines": {"text": "from news-agent"},
            "weather": {"text": "from weather-agent"},
        })]
    );
    assert_eq!(
        agent.inputs("summarizer"),
        vec![json!({"draft": {"text": "from writer"}})]
    );

    let summary = run.trace.summarize();
    assert_eq!(summary.total_tasks, 5);
    assert_eq!(summary.total_retries, 0);
    assert_eq!(summary.fallback_count, 0);
    assert_trace_consistent(&run);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_task_resolves_with_fallback() {
    let timeout = Duration::from_secs(1);
    let max_retries = 2;
    let definition = daily_bundle_with(
        timeout,
        max_retries,
        RunLimits {
            deadline: Duration::from_secs(60),
            cancellation_grace: Duration::from_millis(500),
            min_phase_budget: Duration::ZERO,
        },
    );
    let agent = Arc::new(healthy_agents().script("weather-agent", [Step::Hang]));
    let executor = PipelineExecutor::new(definition, agent.clone())
        .unwrap()
        .with_backoff(BackoffPolicy::immediate());

    let run = executor.run(json!({})).await;

    assert_eq!(run.status, RunStatus::Partial);
    assert!(run.failure.is_none());
    assert_eq!(agent.calls("weather-agent"), 3);
    assert!(run.duration() <= timeout * (max_retries + 1));

    let weather = run.task("weather").unwrap();
    assert_eq!(weather.status, TaskStatus::Fallback);
    assert_eq!(weather.attempt_count, 3);
    assert_eq!(weather.reason.as_deref(), Some("timed out after 3 attempts"));

    let result = run.result.clone().unwrap();
    let section = result.get("weather").unwrap();
    assert!(section.used_fallback);
    assert_eq!(section.payload, Some(json!({"text": "weather unavailable"})));
    assert_eq!(result.fallback_count(), 1);
    assert!(result.missing().is_empty());

    // The writer sees the fallback payload like any other output
    assert_eq!(
        agent.inputs("writer")[0]["weather"],
        json!({"text": "weather unavailable"})
    );

    let summary = run.trace.summarize();
    assert_eq!(summary.fallback_count, 1);
    assert_eq!(summary.total_retries, 2);
    assert_trace_consistent(&run);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_write_phase_skips_publish() {
    let deadline = Duration::from_secs(2);
    let grace = Duration::from_millis(500);
    let definition = daily_bundle().with_limits(RunLimits {
        deadline,
        cancellation_grace: grace,
        min_phase_budget: Duration::ZERO,
    });
    let agent = Arc::new(
        healthy_agents()
            .script(
                "news-agent",
                [Step::delayed(Duration::from_secs(1), Step::reply(json!({"text": "news"})))],
            )
            .script(
                "weather-agent",
                [Step::delayed(Duration::from_secs(1), Step::reply(json!({"text": "sun"})))],
            )
            .script(
                "writer",
                [Step::delayed(Duration::from_secs(5), Step::reply(json!({"text": "late"})))],
            ),
    );
    let executor = PipelineExecutor::new(definition, agent.clone()).unwrap();

    let run = executor.run(json!({})).await;

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.halted, Some(HaltReason::DeadlineExceeded));
    assert!(run.failure.is_none());
    assert!(run.duration() >= deadline);
    assert!(run.duration() <= deadline + grace);

    assert_eq!(agent.calls("summarizer"), 0);
    assert_eq!(agent.calls("scripter"), 0);
    assert_eq!(run.task("draft").unwrap().status, TaskStatus::Timeout);

    let publish = run.phase("publish").unwrap();
    assert!(publish.skipped);

    let result = run.result.clone().unwrap();
    assert_eq!(result.get("headlines").unwrap().state, SectionState::Resolved);
    let missing: Vec<&str> = result.missing().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(missing, ["draft", "summary", "audio_script"]);
    assert_eq!(
        result.get("summary").unwrap().reason.as_deref(),
        Some("pipeline deadline exceeded")
    );
    assert_trace_consistent(&run);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_phase_waits_for_slowest_task() {
    let agent = Arc::new(
        healthy_agents()
            .script(
                "news-agent",
                [Step::delayed(Duration::from_millis(100), Step::reply(json!({})))],
            )
            .script(
                "weather-agent",
                [Step::delayed(Duration::from_millis(700), Step::reply(json!({})))],
            ),
    );
    let executor = PipelineExecutor::new(daily_bundle(), agent.clone()).unwrap();

    let run = executor.run(json!({})).await;

    let research = run.phase("research").unwrap();
    assert_eq!(research.duration(), Duration::from_millis(700));

    let writer_call = agent
        .recorded_calls()
        .into_iter()
        .find(|c| c.agent == "writer")
        .unwrap();
    let weather_call = agent
        .recorded_calls()
        .into_iter()
        .find(|c| c.agent == "weather-agent")
        .unwrap();
    assert_eq!(
        writer_call.at.duration_since(weather_call.at),
        Duration::from_millis(700)
    );
    assert_trace_consistent(&run);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_until_success() {
    let agent = Arc::new(healthy_agents().script(
        "news-agent",
        [
            Step::fail(AgentCallError::ServerError("503".into())),
            Step::fail(AgentCallError::Network("reset".into())),
            Step::reply(json!({"text": "third time"})),
        ],
    ));
    let executor = PipelineExecutor::new(daily_bundle(), agent.clone())
        .unwrap()
        .with_backoff(BackoffPolicy::immediate());

    let run = executor.run(json!({})).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(agent.calls("news-agent"), 3);
    assert_eq!(run.task("headlines").unwrap().retries(), 2);
    assert_eq!(run.trace.summarize().total_retries, 2);
    assert_trace_consistent(&run);
}

#[tokio::test(start_paused = true)]
async fn test_abort_phase_policy_fails_sequential_phase() {
    let definition = PipelineDefinition::new("gated")
        .with_phase(
            PhaseDefinition::sequential("review")
                .with_task(
                    TaskDefinition::new("gate", "gatekeeper")
                        .with_max_retries(0)
                        .with_fallback_policy(FallbackPolicy::AbortPhase),
                )
                .with_task(TaskDefinition::new("polish", "editor")),
        )
        .with_phase(
            PhaseDefinition::parallel("publish").with_task(TaskDefinition::new("post", "poster")),
        );
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("gatekeeper", [Step::fail(AgentCallError::Unauthorized("rejected".into()))])
            .with_default(Step::reply(json!({"ok": true}))),
    );
    let executor = PipelineExecutor::new(definition, agent.clone()).unwrap();

    let run = executor.run(json!({})).await;

    assert_eq!(agent.calls("editor"), 0);
    assert_eq!(agent.calls("poster"), 0);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure.as_ref().unwrap().phase_id, "review");

    let review = run.phase("review").unwrap();
    assert_eq!(review.status, RunStatus::Failed);
    assert_eq!(review.aborted_by.as_deref(), Some("gate"));

    let result = run.result.clone().unwrap();
    assert_eq!(
        result.get("polish").unwrap().reason.as_deref(),
        Some("phase aborted by task 'gate'")
    );
    assert!(result.get("post").unwrap().is_missing());
    assert_trace_consistent(&run);
}

#[tokio::test(start_paused = true)]
async fn test_optional_task_failure_keeps_run_partial() {
    let definition = PipelineDefinition::new("optional")
        .with_phase(
            PhaseDefinition::parallel("research")
                .with_task(TaskDefinition::new("headlines", "news-agent"))
                .with_task(
                    TaskDefinition::new("trivia", "trivia-agent")
                        .with_max_retries(0)
                        .optional(),
                ),
        )
        .with_phase(
            PhaseDefinition::sequential("write").with_task(TaskDefinition::new("draft", "writer")),
        );
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("trivia-agent", [Step::fail(AgentCallError::Misconfigured("gone".into()))])
            .with_default(Step::reply(json!({"text": "ok"}))),
    );
    let executor = PipelineExecutor::new(definition, agent.clone()).unwrap();

    let run = executor.run(json!({})).await;

    assert_eq!(run.status, RunStatus::Partial);
    assert!(run.failure.is_none());
    assert_eq!(agent.calls("writer"), 1);
    assert!(run.result.clone().unwrap().get("trivia").unwrap().is_missing());
    assert_trace_consistent(&run);
}
