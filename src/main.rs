//! Orchestrator command-line entry point

use agent_orchestrator::config::{OrchestratorConfig, AGENT_URL_ENV};
use agent_orchestrator::observability::{init_default_logging, metrics};
use agent_orchestrator::pipeline::{PipelineExecutor, RunStatus};
use agent_orchestrator::trace::{JsonLinesTraceSink, LogTraceSink};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Multi-phase agent pipeline orchestrator
#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Run multi-phase agent pipelines with retries, deadlines and traces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured pipeline once and print its result as JSON
    Run {
        /// Pipeline configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Initial input as a JSON file, or `-` for stdin
        #[arg(short, long, value_name = "FILE", default_value = "-")]
        input: String,

        /// Append the run trace as one JSON line to this file
        #[arg(long, value_name = "FILE")]
        trace_out: Option<PathBuf>,

        /// Pretty-print the result
        #[arg(long)]
        pretty: bool,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Pipeline configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Print the phases and tasks that would run
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let result = match cli.command {
        Commands::Run {
            config,
            input,
            trace_out,
            pretty,
        } => run_pipeline(&config, &input, trace_out, pretty).await,
        Commands::Validate { config, show } => validate_config(&config, show).map(|_| 0),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

async fn run_pipeline(
    config_path: &Path,
    input: &str,
    trace_out: Option<PathBuf>,
    pretty: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let config = OrchestratorConfig::load_from_file(config_path)?;
    if !config.agents.is_configured() {
        return Err(format!(
            "no agent service configured; set [agents].base_url, [agents.endpoints] or {AGENT_URL_ENV}"
        )
        .into());
    }
    let agents = config.agents.registry()?;
    let definition = config.to_definition()?;
    for phase in &definition.phases {
        for task in phase.tasks.iter().filter(|t| !agents.contains(&t.agent)) {
            warn!(task_id = %task.id, agent = %task.agent, "No endpoint serves this agent");
        }
    }
    let initial_input = read_input(input)?;

    let mut executor = PipelineExecutor::new(definition, Arc::new(agents))?
        .with_backoff(config.backoff_policy())
        .with_sink(Arc::new(LogTraceSink));
    if let Some(path) = trace_out {
        executor = executor.with_sink(Arc::new(JsonLinesTraceSink::new(path)));
    }

    let cancel = executor.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, cancelling pipeline run");
            cancel.cancel();
        }
    });

    let run = executor.run(initial_input).await;
    interrupt.abort();

    let result = run.result.ok_or("run finished without a result")?;
    let output = if pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{output}");

    let snapshot = metrics().snapshot();
    info!(
        attempts = snapshot.tasks.attempts,
        retries = snapshot.tasks.retries,
        fallbacks = snapshot.tasks.fallbacks,
        "Run metrics"
    );

    Ok(match run.status {
        RunStatus::Failed => 2,
        _ => 0,
    })
}

fn read_input(source: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let raw = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(source)?
    };

    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(&raw)?)
}

fn validate_config(config_path: &Path, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = OrchestratorConfig::load_from_file(config_path)?;
    let definition = config.to_definition()?;

    if show {
        println!(
            "pipeline '{}': deadline {} ms, grace {} ms",
            definition.name,
            definition.limits.deadline.as_millis(),
            definition.limits.cancellation_grace.as_millis()
        );
        for phase in &definition.phases {
            println!(
                "  [{}] {} ({}, input {})",
                phase.ordinal,
                phase.id,
                phase.mode,
                phase.input_mapping.describe()
            );
            for task in &phase.tasks {
                println!(
                    "      {} -> {} (timeout {} ms, max_retries {}, fallback {})",
                    task.id,
                    task.agent,
                    task.timeout.as_millis(),
                    task.max_retries,
                    if task.usable_fallback().is_some() { "yes" } else { "no" }
                );
            }
        }
    }

    info!(pipeline = %definition.name, "Configuration is valid");
    Ok(())
}
