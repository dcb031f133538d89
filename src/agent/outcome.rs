//! Tagged result of one agent attempt

use crate::error::{sanitize_error_message, AgentCallError, ErrorCategory};
use serde_json::Value;

const RAW_PREVIEW_LEN: usize = 200;

/// What one attempt produced, after parsing at the runner boundary
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Success(Value),
    /// Reply was not JSON, or did not match the expected shape
    ParseError { raw: String, reason: String },
    AgentError(AgentCallError),
}

impl AgentOutcome {
    /// Interpret a raw reply
    ///
    /// A JSON object whose only key is `error`, holding `{code, message}`,
    /// is an agent-reported failure rather than a payload.
    pub fn from_reply(raw: String) -> Self {
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                return AgentOutcome::ParseError {
                    reason: format!("reply is not valid JSON: {e}"),
                    raw,
                }
            }
        };

        if let Some(error) = reported_error(&value) {
            return AgentOutcome::AgentError(error);
        }
        AgentOutcome::Success(value)
    }

    pub fn from_result(result: Result<String, AgentCallError>) -> Self {
        match result {
            Ok(raw) => Self::from_reply(raw),
            Err(error) => AgentOutcome::AgentError(error),
        }
    }

    /// Downgrade a success that violates `schema` to a parse error
    pub fn conform(self, schema: Option<&jsonschema::Validator>) -> Self {
        let violation = match (schema, &self) {
            (Some(validator), AgentOutcome::Success(value)) => {
                validator.validate(value).err().map(|errors| {
                    let details = errors
                        .map(|e| format!("at '{}': {}", e.instance_path, e))
                        .collect::<Vec<_>>()
                        .join("; ");
                    (value.to_string(), details)
                })
            }
            _ => None,
        };

        match violation {
            None => self,
            Some((raw, details)) => AgentOutcome::ParseError {
                raw,
                reason: format!("output does not match schema: {details}"),
            },
        }
    }

    /// Retry classification; `None` on success
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            AgentOutcome::Success(_) => None,
            AgentOutcome::ParseError { .. } => Some(ErrorCategory::Validation),
            AgentOutcome::AgentError(error) => Some(error.category()),
        }
    }

    /// Sanitized description of a failed attempt
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            AgentOutcome::Success(_) => None,
            AgentOutcome::ParseError { raw, reason } => {
                let preview: String = raw.chars().take(RAW_PREVIEW_LEN).collect();
                Some(sanitize_error_message(&format!("{reason} (reply: {preview})")))
            }
            AgentOutcome::AgentError(error) => Some(sanitize_error_message(&error.to_string())),
        }
    }
}

fn reported_error(value: &Value) -> Option<AgentCallError> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let error = object.get("error")?.as_object()?;
    let code = error.get("code")?.as_str()?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(AgentCallError::remote(code, message))
}
