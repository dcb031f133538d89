//! Hand-off of finished traces to external consumers

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::trace::collector::TraceCollector;
use crate::trace::event::TraceEntry;
use crate::trace::summary::TraceSummary;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

/// Everything recorded about one run, keyed by `run_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub summary: TraceSummary,
    pub entries: Vec<TraceEntry>,
    /// Events that arrived after the run was sealed
    pub dropped_entries: u64,
}

impl TraceReport {
    pub fn from_collector(pipeline: impl Into<String>, trace: &TraceCollector) -> Self {
        let entries = trace.entries();
        Self {
            run_id: trace.run_id(),
            pipeline: pipeline.into(),
            summary: TraceSummary::from_entries(trace.run_id(), &entries),
            entries,
            dropped_entries: trace.dropped(),
        }
    }
}

/// Destination for finished run traces
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn publish(&self, report: &TraceReport) -> OrchestratorResult<()>;
}

/// Emits the summary as a structured log event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

#[async_trait]
impl TraceSink for LogTraceSink {
    async fn publish(&self, report: &TraceReport) -> OrchestratorResult<()> {
        let summary = &report.summary;
        info!(
            run_id = %report.run_id,
            pipeline = %report.pipeline,
            status = ?summary.status,
            end_to_end_ms = summary.end_to_end.as_millis() as u64,
            tasks = summary.total_tasks,
            retries = summary.total_retries,
            fallback_ratio = summary.fallback_ratio,
            events = summary.event_count,
            "Run trace summary"
        );
        Ok(())
    }
}

/// Appends one JSON document per run to a file
#[derive(Debug, Clone)]
pub struct JsonLinesTraceSink {
    path: PathBuf,
}

impl JsonLinesTraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonLinesTraceSink {
    async fn publish(&self, report: &TraceReport) -> OrchestratorResult<()> {
        let mut line = serde_json::to_string(report)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                OrchestratorError::trace_sink(format!(
                    "cannot open {}: {e}",
                    self.path.display()
                ))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps reports in memory
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    reports: Mutex<Vec<TraceReport>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<TraceReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn publish(&self, report: &TraceReport) -> OrchestratorResult<()> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(report.clone());
        Ok(())
    }
}
