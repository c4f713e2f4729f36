//! Token counting
//!
//! Counters map `(text, model)` to a token count. They must never undercount
//! relative to the target model, since budget checks rely on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tiktoken_rs::CoreBPE;

use crate::error::{ContextError, ContextResult};

/// Framing tokens chat models add around each message (role and separators).
pub const CHAT_MESSAGE_OVERHEAD: usize = 4;

/// Tokens that prime the assistant reply after the last message.
pub const CHAT_REPLY_PRIMING: usize = 3;

/// Pluggable token counting function.
pub trait TokenCounter: Send + Sync {
    /// Count the tokens `text` occupies for `model`.
    fn count(&self, text: &str, model: &str) -> ContextResult<usize>;

    /// Tokens charged per chat message on top of its content.
    fn message_overhead(&self, _model: &str) -> usize {
        0
    }

    /// Tokens charged once per prompt for priming the reply.
    fn reply_priming(&self, _model: &str) -> usize {
        0
    }
}

/// Exact BPE counter backed by `tiktoken-rs`.
///
/// The encoding for a model is loaded on first use and cached. Models that
/// tiktoken does not know are reported as [`ContextError::UnsupportedModel`].
#[derive(Default)]
pub struct TiktokenCounter {
    encodings: Mutex<HashMap<String, Arc<CoreBPE>>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoding_for(&self, model: &str) -> ContextResult<Arc<CoreBPE>> {
        let mut encodings = self
            .encodings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(bpe) = encodings.get(model) {
            return Ok(Arc::clone(bpe));
        }

        let bpe = tiktoken_rs::get_bpe_from_model(model).map_err(|err| {
            tracing::debug!(model, error = %err, "tiktoken has no encoding for model");
            ContextError::UnsupportedModel(model.to_string())
        })?;
        let bpe = Arc::new(bpe);
        encodings.insert(model.to_string(), Arc::clone(&bpe));
        Ok(bpe)
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str, model: &str) -> ContextResult<usize> {
        let bpe = self.encoding_for(model)?;
        if text.is_empty() {
            return Ok(0);
        }
        Ok(bpe.encode_with_special_tokens(text).len())
    }

    fn message_overhead(&self, _model: &str) -> usize {
        CHAT_MESSAGE_OVERHEAD
    }

    fn reply_priming(&self, _model: &str) -> usize {
        CHAT_REPLY_PRIMING
    }
}

/// Rough estimate: ASCII text at 4 bytes per token, rounded up, and every
/// byte of non-ASCII text as a token of its own.
///
/// Accepts any model. Byte-level BPE never produces more tokens than bytes,
/// so CJK and emoji text, where one character can take several tokens, is
/// never undercounted.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str, _model: &str) -> ContextResult<usize> {
        let ascii = text.bytes().filter(u8::is_ascii).count();
        Ok(ascii.div_ceil(4) + (text.len() - ascii))
    }

    fn message_overhead(&self, _model: &str) -> usize {
        CHAT_MESSAGE_OVERHEAD
    }

    fn reply_priming(&self, _model: &str) -> usize {
        CHAT_REPLY_PRIMING
    }
}
