//! Context window management

use serde::{Deserialize, Serialize};

use crate::context::{ChatMessage, Message};
use crate::error::{ContextError, ContextResult};
use crate::tokens::TokenCounter;

/// Context window configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextWindow {
    /// Token budget for the whole prompt. A window must stay strictly below it.
    pub max_tokens: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self { max_tokens: 4096 }
    }
}

/// Prompt assembled by [`ContextWindow::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltWindow {
    /// System preamble, retained history oldest to newest, incoming message.
    pub messages: Vec<ChatMessage>,
    /// Tokens counted across every entry of `messages`, including per-message
    /// framing and reply priming when the counter charges them.
    pub prompt_tokens: usize,
    /// History messages kept in the window.
    pub retained: usize,
    /// Oldest history messages left out to fit the budget.
    pub dropped: usize,
}

impl ContextWindow {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Assemble the prompt for `incoming` on top of `history`.
    ///
    /// Keeps the longest trailing run of `history` such that the preamble,
    /// the retained run and the incoming message together stay below
    /// `max_tokens`. Fails with [`ContextError::RejectedTooLong`] when the
    /// preamble and the incoming message alone already reach the budget.
    pub fn build(
        &self,
        counter: &dyn TokenCounter,
        model: &str,
        preamble: &str,
        history: &[Message],
        incoming: &str,
    ) -> ContextResult<BuiltWindow> {
        let overhead = counter.message_overhead(model);
        let preamble_tokens = counter.count(preamble, model)? + overhead;
        let incoming_tokens = counter.count(incoming, model)? + overhead;
        let fixed = preamble_tokens + incoming_tokens + counter.reply_priming(model);

        if fixed >= self.max_tokens {
            return Err(ContextError::RejectedTooLong {
                tokens: fixed,
                budget: self.max_tokens,
            });
        }

        // Newest first; the first message that does not fit ends the run, so
        // the kept messages are always a contiguous suffix.
        let mut total = fixed;
        let mut start = history.len();
        for message in history.iter().rev() {
            let tokens = counter.count(&message.content, model)? + overhead;
            if total + tokens >= self.max_tokens {
                break;
            }
            total += tokens;
            start -= 1;
        }

        let retained = &history[start..];
        let mut messages = Vec::with_capacity(retained.len() + 2);
        messages.push(ChatMessage::system(preamble));
        messages.extend(retained.iter().map(ChatMessage::from));
        messages.push(ChatMessage::user(incoming));

        if start > 0 {
            tracing::debug!(
                dropped = start,
                retained = retained.len(),
                prompt_tokens = total,
                budget = self.max_tokens,
                "truncated oldest history to fit context window"
            );
        }

        Ok(BuiltWindow {
            messages,
            prompt_tokens: total,
            retained: retained.len(),
            dropped: start,
        })
    }
}
