//! Error types for context management

use thiserror::Error;

/// Context management error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("no tokenizer registered for model `{0}`")]
    UnsupportedModel(String),

    #[error("message too long: {tokens} tokens with the system prompt, budget is {budget}")]
    RejectedTooLong { tokens: usize, budget: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
