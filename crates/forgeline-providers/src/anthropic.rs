//! Anthropic Messages API agent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::traits::{AgentResponse, CliAgent, ProviderError};
use forgeline_core::config::AnthropicConfig;
use forgeline_core::secrets::ApiKey;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Agent that answers prompts through the Anthropic Messages API.
///
/// Has no filesystem access; `execute_in_project` ignores the path.
pub struct AnthropicAgent {
    client: Client,
    api_key: ApiKey,
    base_url: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl AnthropicAgent {
    /// Create a new Anthropic agent with default model and limits.
    #[must_use]
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            timeout: Duration::from_secs(600),
        }
    }

    /// Build from configuration, taking the key from config or `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` if no API key is available.
    pub fn from_config(config: &AnthropicConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .map(ApiKey::new)
            .or_else(|| ApiKey::from_env("ANTHROPIC_API_KEY"))
            .ok_or_else(|| {
                ProviderError::Config("Anthropic API key not configured".to_string())
            })?;

        let mut agent = Self::new(api_key).with_model(config.model.clone());
        agent.max_tokens = config.max_tokens;
        if let Some(base_url) = &config.base_url {
            agent = agent.with_base_url(base_url.clone());
        }
        Ok(agent)
    }

    /// Use a custom base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Use a specific model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn to_request(&self, prompt: &str) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        }
    }

    async fn send(&self, prompt: &str) -> Result<AgentResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.to_request(prompt))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                return Err(ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        let result: MessagesResponse = response.json().await.map_err(|e| self.classify(e))?;
        Ok(result.into())
    }

    fn classify(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Network(error)
        }
    }
}

#[async_trait]
impl CliAgent for AnthropicAgent {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn execute(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, ProviderError> {
        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "Calling Anthropic API");
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = self.send(prompt) => result,
        }
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

impl From<MessagesResponse> for AgentResponse {
    fn from(resp: MessagesResponse) -> Self {
        let content = resp
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut response = Self::ok(content)
            .with_metadata("model", serde_json::Value::String(resp.model))
            .with_metadata("usage", resp.usage);
        if let Some(reason) = resp.stop_reason {
            response = response.with_metadata("stop_reason", serde_json::Value::String(reason));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::tokens_from_metadata;

    #[test]
    fn test_agent_name() {
        let agent = AnthropicAgent::new(ApiKey::new("test".to_string()));
        assert_eq!(agent.name(), "anthropic");
    }

    #[test]
    fn test_request_shape() {
        let agent = AnthropicAgent::new(ApiKey::new("test".to_string())).with_model("claude-x");
        let request = serde_json::to_value(agent.to_request("Summarize the ticket")).unwrap();
        assert_eq!(request["model"], "claude-x");
        assert_eq!(request["messages"][0]["role"], "user");
        assert_eq!(request["messages"][0]["content"], "Summarize the ticket");
    }

    #[test]
    fn test_response_conversion() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "model": "claude-x",
            "content": [
                {"type": "text", "text": "Part one"},
                {"type": "tool_use", "id": "t", "name": "n", "input": {}},
                {"type": "text", "text": "Part two"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 40, "output_tokens": 60}
        });
        let parsed: MessagesResponse = serde_json::from_value(raw).unwrap();
        let response: AgentResponse = parsed.into();

        assert!(response.success);
        assert_eq!(response.content, "Part one\nPart two");
        assert_eq!(tokens_from_metadata(&response.metadata), Some(100));
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = AnthropicConfig {
            api_key: Some("sk-test".to_string()),
            base_url: Some("http://localhost:9".to_string()),
            model: "claude-y".to_string(),
            max_tokens: 100,
        };
        let agent = AnthropicAgent::from_config(&config).unwrap();
        assert_eq!(agent.model, "claude-y");
        assert_eq!(agent.base_url, "http://localhost:9");
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let agent = AnthropicAgent::new(ApiKey::new("test".to_string()))
            .with_base_url("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = agent.execute("hello", &cancel).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}
