//! Runtime abstractions for completion providers.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use partybot_context::ChatMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod providers;

pub use providers::{OpenAIConfig, OpenAIProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    /// Ordered role-tagged prompt; the last entry is the message to answer.
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("mock provider has no queued response")]
    MockQueueEmpty,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error("provider returned no completion")]
    EmptyResponse,
    #[error("provider error: {0}")]
    Message(String),
}

impl ProviderError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MockQueueEmpty => "mock_queue_empty",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::Decode(_) => "decode",
            Self::EmptyResponse => "empty_response",
            Self::Message(_) => "message",
        }
    }
}

/// Remote chat-completion service.
///
/// Implementations do not retry; callers decide what a failure means.
#[async_trait]
pub trait AIProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

#[derive(Debug, Default)]
pub struct MockProvider {
    queue: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, result: Result<CompletionResponse, ProviderError>) {
        self.queue
            .lock()
            .expect("mock queue poisoned")
            .push_back(result);
    }

    /// Queue a successful completion with the given text.
    pub fn enqueue_reply(&self, content: impl Into<String>) {
        self.enqueue(Ok(CompletionResponse {
            content: content.into(),
            model: Some("mock-1".to_string()),
            finish_reason: Some("stop".to_string()),
            usage: None,
        }));
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }
}

#[async_trait]
impl AIProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .push(req);
        self.queue
            .lock()
            .expect("mock queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))
    }
}
