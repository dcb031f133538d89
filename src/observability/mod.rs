//! Structured logging and process-wide metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsSnapshot, PipelineMetrics};

// Span macros for structured logging
pub use logging::{phase_span, run_span, task_span};
