//! OpenAI API Provider
//!
//! Implements the AIProvider trait for OpenAI's Chat Completions API.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use partybot_context::ChatMessage;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{AIProvider, CompletionRequest, CompletionResponse, ProviderError, TokenUsage};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`OpenAIProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAIConfig {
    pub api_key: String,
    /// API root including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_API_BASE.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Read `OPENAI_API_KEY` and the optional `OPENAI_API_BASE`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            ProviderError::Message("OPENAI_API_KEY environment variable must be set".to_string())
        })?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_API_BASE") {
            config.base_url = base_url;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
pub struct OpenAIProvider {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn payload(req: CompletionRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: req.model,
            messages: req.messages.into_iter().map(WireMessage::from).collect(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        }
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> ProviderError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or(body);

        ProviderError::HttpStatus {
            status: status.as_u16(),
            body: message,
        }
    }
}

fn transport_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[async_trait]
impl AIProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let payload = Self::payload(req);
        tracing::debug!(
            model = %payload.model,
            messages = payload.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(self.endpoint("/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Decode(err.to_string())
            }
        })?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or(ProviderError::EmptyResponse)?;
        let content = choice
            .message
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or(ProviderError::EmptyResponse)?;

        Ok(CompletionResponse {
            content,
            model: Some(body.model),
            finish_reason: choice.finish_reason,
            usage: body.usage.map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }),
        })
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<ChatMessage> for WireMessage {
    fn from(message: ChatMessage) -> Self {
        Self {
            role: message.role.as_str(),
            content: message.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![
                ChatMessage::system("You are a party bot."),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
                ChatMessage::user("tell me a joke"),
            ],
            max_tokens: Some(32),
            temperature: Some(0.5),
        }
    }

    fn provider_for(server: &MockServer, api_key: &str) -> OpenAIProvider {
        let config = OpenAIConfig::new(api_key).with_base_url(format!("{}/v1", server.base_url()));
        OpenAIProvider::new(config).unwrap()
    }

    #[test]
    fn endpoint_building() {
        let provider = OpenAIProvider::new(OpenAIConfig::new("key")).unwrap();
        assert_eq!(
            provider.endpoint("/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );

        let provider = OpenAIProvider::new(
            OpenAIConfig::new("key").with_base_url("https://proxy.example.com/v1/"),
        )
        .unwrap();
        assert_eq!(
            provider.endpoint("/chat/completions"),
            "https://proxy.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn payload_keeps_message_order_and_roles() {
        let payload = serde_json::to_value(OpenAIProvider::payload(request())).unwrap();

        assert_eq!(payload["model"], "gpt-3.5-turbo");
        assert_eq!(payload["max_tokens"], 32);
        let roles: Vec<_> = payload["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(payload["messages"][3]["content"], "tell me a joke");
    }

    #[test]
    fn payload_omits_unset_options() {
        let mut req = request();
        req.max_tokens = None;
        req.temperature = None;

        let payload = serde_json::to_value(OpenAIProvider::payload(req)).unwrap();

        assert!(payload.get("max_tokens").is_none());
        assert!(payload.get("temperature").is_none());
    }

    #[tokio::test]
    async fn complete_calls_chat_completions_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .body_includes("\"role\":\"system\"")
                    .body_includes("tell me a joke");
                then.status(200).json_body(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "model": "gpt-3.5-turbo-0125",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Why did the chicken cross the road?"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 30, "completion_tokens": 9, "total_tokens": 39}
                }));
            })
            .await;

        let response = provider_for(&server, "test-key")
            .complete(request())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "Why did the chicken cross the road?");
        assert_eq!(response.model.as_deref(), Some("gpt-3.5-turbo-0125"));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                prompt_tokens: 30,
                completion_tokens: 9
            })
        );
    }

    #[tokio::test]
    async fn complete_maps_error_status_with_api_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429).json_body(json!({
                    "error": {
                        "message": "Rate limit exceeded",
                        "type": "rate_limit_error"
                    }
                }));
            })
            .await;

        let err = provider_for(&server, "test-key")
            .complete(request())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ProviderError::HttpStatus {
                status: 429,
                body: "Rate limit exceeded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn complete_keeps_raw_body_when_error_is_not_json() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(502).body("bad gateway");
            })
            .await;

        let err = provider_for(&server, "test-key")
            .complete(request())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[tokio::test]
    async fn complete_rejects_response_without_choices() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .json_body(json!({"model": "gpt-3.5-turbo", "choices": []}));
            })
            .await;

        let err = provider_for(&server, "test-key")
            .complete(request())
            .await
            .unwrap_err();

        assert_eq!(err, ProviderError::EmptyResponse);
    }

    #[tokio::test]
    async fn complete_reports_malformed_body_as_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .body("{not json");
            })
            .await;

        let err = provider_for(&server, "test-key")
            .complete(request())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "decode");
    }

    #[tokio::test]
    async fn complete_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({"model": "gpt-3.5-turbo", "choices": []}));
            })
            .await;

        let config = OpenAIConfig::new("test-key")
            .with_base_url(format!("{}/v1", server.base_url()))
            .with_timeout(Duration::from_millis(50));
        let err = OpenAIProvider::new(config)
            .unwrap()
            .complete(request())
            .await
            .unwrap_err();

        assert_eq!(err, ProviderError::Timeout);
    }
}
