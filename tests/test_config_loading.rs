//! Configuration loading from disk and execution of the resulting pipeline

use agent_orchestrator::config::{ConfigError, OrchestratorConfig};
use agent_orchestrator::pipeline::{ExecutionMode, PipelineExecutor, RunStatus, TaskStatus};
use agent_orchestrator::testing::{ScriptedAgent, Step};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const PIPELINE_TOML: &str = r#"
[pipeline]
name = "newsroom"
deadline_ms = 30000
cancellation_grace_ms = 250

[backoff]
base_delay_ms = 50
factor = 2.0
max_delay_ms = 1000

[agents]
base_url = "http://agents.internal:8700"
request_timeout_ms = 10000

[[phases]]
id = "research"
mode = "parallel"

  [[phases.tasks]]
  id = "headlines"
  agent = "news-agent"
  timeout_ms = 2000
  output_schema = { type = "object", required = ["text"] }

  [[phases.tasks]]
  id = "weather"
  agent = "weather-agent"
  required = false
  fallback = { text = "Weather unavailable" }

[[phases]]
id = "write"
mode = "sequential"
input = "field"
field = "headlines"

  [[phases.tasks]]
  id = "draft"
  agent = "writer"

  [[phases.tasks]]
  id = "edit"
  agent = "editor"
  depends_on = ["draft"]
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{content}").unwrap();
    file
}

#[test]
fn test_load_valid_config_from_file() {
    let file = write_config(PIPELINE_TOML);

    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.pipeline.name, "newsroom");
    assert_eq!(config.pipeline.deadline_ms, 30000);
    assert_eq!(config.agents.request_timeout(), Duration::from_secs(10));
    assert_eq!(config.phases.len(), 2);

    let definition = config.to_definition().unwrap();
    assert_eq!(definition.limits.deadline, Duration::from_secs(30));
    assert_eq!(definition.limits.cancellation_grace, Duration::from_millis(250));
    assert_eq!(definition.phases[1].mode, ExecutionMode::Sequential);
    assert_eq!(definition.phases[1].input_mapping.describe(), "field:headlines");

    let weather = definition.phases[0].task("weather").unwrap();
    assert!(!weather.required);
    assert_eq!(weather.max_retries, 2);
    assert_eq!(weather.timeout, Duration::from_secs(30));

    let backoff = config.backoff_policy();
    assert_eq!(backoff.base_delay, Duration::from_millis(50));
    assert_eq!(backoff.max_delay, Duration::from_secs(1));
}

#[test]
fn test_missing_file_is_reported() {
    let result = OrchestratorConfig::load_from_file(std::path::Path::new(
        "/nonexistent/orchestrator.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_reported() {
    let file = write_config("[pipeline\nname = ");
    let result = OrchestratorConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let file = write_config(
        r#"
[pipeline]
name = "broken"

[[phases]]
id = "write"
mode = "sequential"

  [[phases.tasks]]
  id = "edit"
  agent = "editor"
  depends_on = ["draft"]
"#,
    );

    let err = OrchestratorConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidConfig(_)));
    assert!(err.to_string().contains("draft"));
}

#[tokio::test(start_paused = true)]
async fn test_loaded_pipeline_runs_end_to_end() {
    let file = write_config(PIPELINE_TOML);
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    let agent = Arc::new(
        ScriptedAgent::new()
            .script(
                "news-agent",
                [
                    Step::reply(json!({"title": "missing text"})),
                    Step::reply(json!({"text": "rust ships"})),
                ],
            )
            .script("weather-agent", [Step::reply(json!({"text": "sunny"}))])
            .script("writer", [Step::reply(json!({"text": "draft"}))])
            .script("editor", [Step::reply(json!({"text": "final"}))]),
    );
    let executor = PipelineExecutor::new(config.to_definition().unwrap(), agent.clone())
        .unwrap()
        .with_backoff(config.backoff_policy());

    let run = executor.run(json!({"topic": "rust"})).await;

    assert_eq!(run.status, RunStatus::Completed);

    // One corrective retry after the schema violation
    let news_inputs = agent.inputs("news-agent");
    assert_eq!(news_inputs.len(), 2);
    assert_eq!(news_inputs[1]["input"], json!({"topic": "rust"}));
    assert!(news_inputs[1]["correction"]["previous_error"].is_string());
    assert_eq!(run.task("headlines").unwrap().status, TaskStatus::Success);

    assert_eq!(agent.inputs("writer"), vec![json!({"text": "rust ships"})]);
    assert_eq!(
        agent.inputs("editor"),
        vec![json!({
            "input": {"text": "rust ships"},
            "dependencies": {"draft": {"text": "draft"}},
        })]
    );
}
