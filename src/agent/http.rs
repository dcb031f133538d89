//! JSON-over-HTTP agent adapter
//!
//! Posts `{"agent": <name>, "payload": <payload>}` to
//! `{base_url}/agents/{name}/invoke` and maps the response status onto
//! [`AgentCallError`] variants. A single request is made per call; the task
//! runner owns retries and timeouts.

use crate::agent::invoker::AgentInvoker;
use crate::error::{AgentCallError, OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    agent: &'a str,
    payload: Value,
}

/// Invokes agents exposed by an HTTP service
#[derive(Debug, Clone)]
pub struct HttpAgentInvoker {
    base_url: Url,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl HttpAgentInvoker {
    pub fn new(base_url: &str, request_timeout: Duration) -> OrchestratorResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            OrchestratorError::invalid_input(format!("invalid agent base URL '{base_url}': {e}"))
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(OrchestratorError::invalid_input(format!(
                "agent base URL '{base_url}' must be an http(s) URL"
            )));
        }

        Ok(Self {
            base_url,
            request_timeout,
            client: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base_url}/agents/{agent}/invoke`, with the agent name percent-encoded
    pub fn endpoint(&self, agent: &str) -> Result<Url, AgentCallError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AgentCallError::Misconfigured(format!("cannot extend {}", self.base_url)))?
            .pop_if_empty()
            .extend(["agents", agent, "invoke"]);
        Ok(url)
    }
}

fn classify_status(status: StatusCode, agent: &str, body: &str) -> AgentCallError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => AgentCallError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentCallError::Unauthorized(detail),
        StatusCode::NOT_FOUND => AgentCallError::UnknownAgent(agent.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AgentCallError::Timeout(detail),
        s if s.is_server_error() => AgentCallError::ServerError(detail),
        _ => AgentCallError::Misconfigured(detail),
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, agent: &str, payload: Value) -> Result<String, AgentCallError> {
        let url = self.endpoint(agent)?;
        debug!(agent, url = %url, "Invoking agent over HTTP");

        let response = self
            .client
            .post(url)
            .json(&InvokeRequest { agent, payload })
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentCallError::Timeout(format!("no response within {:?}", self.request_timeout))
                } else {
                    AgentCallError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentCallError::Network(format!("failed to read response body: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, agent, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn invoker_for(server: &MockServer) -> HttpAgentInvoker {
        HttpAgentInvoker::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_invocation_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/news-agent/invoke"))
            .and(body_json(json!({"agent": "news-agent", "payload": {"topic": "rust"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "headlines"})))
            .expect(1)
            .mount(&server)
            .await;

        let invoker = invoker_for(&server).await;
        let reply = invoker
            .invoke("news-agent", json!({"topic": "rust"}))
            .await
            .unwrap();

        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply, json!({"text": "headlines"}));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_categories() {
        let cases = [
            (429, ErrorCategory::Transient),
            (503, ErrorCategory::Transient),
            (401, ErrorCategory::Fatal),
            (403, ErrorCategory::Fatal),
            (404, ErrorCategory::Fatal),
            (422, ErrorCategory::Fatal),
            (504, ErrorCategory::Timeout),
        ];

        for (status, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let invoker = invoker_for(&server).await;
            let error = invoker.invoke("agent", json!({})).await.unwrap_err();
            assert_eq!(error.category(), expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_not_found_names_the_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let error = invoker_for(&server)
            .await
            .invoke("ghost", json!({}))
            .await
            .unwrap_err();
        assert_eq!(error, AgentCallError::UnknownAgent("ghost".into()));
    }

    #[tokio::test]
    async fn test_slow_agent_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let invoker = HttpAgentInvoker::new(&server.uri(), Duration::from_millis(50)).unwrap();
        let error = invoker.invoke("slow", json!({})).await.unwrap_err();
        assert!(matches!(error, AgentCallError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let invoker =
            HttpAgentInvoker::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let error = invoker.invoke("agent", json!({})).await.unwrap_err();
        assert_eq!(error.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_endpoint_keeps_base_path_and_encodes_name() {
        let invoker =
            HttpAgentInvoker::new("http://agents.local:8700/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            invoker.endpoint("news agent").unwrap().as_str(),
            "http://agents.local:8700/api/agents/news%20agent/invoke"
        );

        let invoker =
            HttpAgentInvoker::new("http://agents.local:8700/api", Duration::from_secs(1)).unwrap();
        assert_eq!(
            invoker.endpoint("news").unwrap().as_str(),
            "http://agents.local:8700/api/agents/news/invoke"
        );
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        assert!(HttpAgentInvoker::new("mailto:ops@example.com", Duration::from_secs(1)).is_err());
        assert!(HttpAgentInvoker::new("not a url", Duration::from_secs(1)).is_err());
    }
}
