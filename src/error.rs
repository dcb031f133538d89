//! Error types for pipeline orchestration
//!
//! Two families live here. [`OrchestratorError`] covers failures of the
//! engine's own surfaces (configuration, definitions, trace sinks).
//! [`AgentCallError`] is the error side of a single agent invocation; it
//! never escapes the task runner; it is classified into an
//! [`ErrorCategory`] and folded into a task status instead.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid pipeline definition: {message}")]
    InvalidDefinition { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Trace sink error: {message}")]
    TraceSink { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Create invalid definition error
    pub fn invalid_definition<S: Into<String>>(message: S) -> Self {
        Self::InvalidDefinition {
            message: message.into(),
        }
    }

    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create trace sink error
    pub fn trace_sink<S: Into<String>>(message: S) -> Self {
        Self::TraceSink {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Retry classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network or rate-limit failure; retryable
    Transient,
    /// Attempt exceeded its deadline; retryable up to the task's limit
    Timeout,
    /// Malformed or unexpected output; one corrective retry
    Validation,
    /// Authentication or configuration failure; never retried
    Fatal,
}

impl ErrorCategory {
    /// Whether the category allows another attempt at all
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorCategory::Fatal)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Failure reported by an agent invocation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentCallError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("Agent service error: {0}")]
    ServerError(String),
    #[error("Agent call timed out: {0}")]
    Timeout(String),
    #[error("Invalid agent response: {0}")]
    InvalidResponse(String),
    #[error("Authentication failed: {0}")]
    Unauthorized(String),
    #[error("Agent misconfigured: {0}")]
    Misconfigured(String),
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
    #[error("Agent error [{code}]: {message}")]
    Remote { code: String, message: String },
}

impl AgentCallError {
    /// Create a remote, agent-reported error
    pub fn remote<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &str {
        match self {
            AgentCallError::Network(_) => "network",
            AgentCallError::RateLimited(_) => "rate_limited",
            AgentCallError::ServerError(_) => "server_error",
            AgentCallError::Timeout(_) => "timeout",
            AgentCallError::InvalidResponse(_) => "invalid_response",
            AgentCallError::Unauthorized(_) => "unauthorized",
            AgentCallError::Misconfigured(_) => "misconfigured",
            AgentCallError::UnknownAgent(_) => "unknown_agent",
            AgentCallError::Remote { code, .. } => code,
        }
    }

    /// Classify this error for the retry policy
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentCallError::Network(_)
            | AgentCallError::RateLimited(_)
            | AgentCallError::ServerError(_) => ErrorCategory::Transient,
            AgentCallError::Timeout(_) => ErrorCategory::Timeout,
            AgentCallError::InvalidResponse(_) => ErrorCategory::Validation,
            AgentCallError::Unauthorized(_)
            | AgentCallError::Misconfigured(_)
            | AgentCallError::UnknownAgent(_) => ErrorCategory::Fatal,
            AgentCallError::Remote { code, .. } => classify_remote_code(code),
        }
    }
}

/// Classify an agent-reported error code by its family
fn classify_remote_code(code: &str) -> ErrorCategory {
    let code = code.to_ascii_lowercase();
    if code.starts_with("rate_limit")
        || code == "unavailable"
        || code == "overloaded"
        || code == "network"
    {
        ErrorCategory::Transient
    } else if code.contains("timeout") {
        ErrorCategory::Timeout
    } else if code == "invalid_output" || code.contains("schema") || code == "parse_error" {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Fatal
    }
}

const MAX_REASON_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Sanitize a human-readable reason before it is placed in a result or trace
///
/// Secrets are redacted, sensitive paths are masked, and the text is capped
/// at 500 bytes on a character boundary.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}
