//! Completion provider implementations
//!
//! Concrete implementations of the AIProvider trait.

pub mod openai;

pub use openai::{OpenAIConfig, OpenAIProvider};
