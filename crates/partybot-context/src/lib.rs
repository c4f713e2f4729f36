//! Partybot Context Management - token-bounded conversation windows
//!
//! This crate provides:
//! - Conversation message types
//! - Token counting (tiktoken BPE or a character heuristic)
//! - Context window assembly under a token budget

pub mod context;
pub mod error;
pub mod tokens;
pub mod window;

pub use context::{ChatMessage, ConversationId, Message, MessageId, MessageRole, AI_SPEAKER};
pub use error::{ContextError, ContextResult};
pub use tokens::{
    HeuristicCounter, TiktokenCounter, TokenCounter, CHAT_MESSAGE_OVERHEAD, CHAT_REPLY_PRIMING,
};
pub use window::{BuiltWindow, ContextWindow};

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::{ChatMessage, ConversationId, Message, MessageRole};
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::tokens::TokenCounter;
    pub use crate::window::{BuiltWindow, ContextWindow};
}
