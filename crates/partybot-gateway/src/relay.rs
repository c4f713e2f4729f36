//! Relay orchestration: mention in, windowed completion out.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use partybot_context::{ContextError, ConversationId, MessageRole, TokenCounter, AI_SPEAKER};
use partybot_runtime::{AIProvider, CompletionRequest, ProviderError};
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::db::{HistoryError, HistoryStore};
use crate::metrics;

/// Speaker label used when the sender's display name cannot be resolved.
pub const FALLBACK_SPEAKER: &str = "User";

pub const TOO_LONG_MESSAGE: &str =
    "Sorry, your message is too long for me to handle. Please shorten it and try again.";
pub const APOLOGY_MESSAGE: &str =
    "Sorry, I couldn't come up with a reply right now. Please try sending your message again.";
pub const FAILURE_MESSAGE: &str = "Sorry, something went wrong on my side. Please try again later.";
pub const EMPTY_MENTION_MESSAGE: &str = "Hi! Mention me together with a message and I'll answer.";
pub const RESET_CONFIRMATION: &str = "Conversation history has been reset.";

/// Maps a chat user id to a human readable name.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn display_name(&self, user_id: &str) -> anyhow::Result<String>;
}

/// Text to deliver back into a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingReply {
    pub channel: String,
    /// Thread to answer in, if the mention came from one.
    pub thread_ts: Option<String>,
    pub text: String,
}

/// Delivers replies to the chat platform.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn post_reply(&self, reply: &OutgoingReply) -> anyhow::Result<()>;
}

/// Inbound message addressed to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionEvent {
    pub conversation_id: ConversationId,
    pub sender_id: String,
    /// Raw text, still containing the bot mention token.
    pub text: String,
}

/// How a mention was handled. Every variant carries the text to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Answered { reply: String },
    /// Nothing left after stripping the mention.
    Empty,
    /// Preamble plus message alone exceed the token budget.
    TooLong,
    /// The completion service failed or timed out.
    CompletionFailed,
    /// Storage or configuration failure before the completion call.
    Failed,
}

impl RelayOutcome {
    /// User-visible text for this outcome.
    pub fn message(&self) -> &str {
        match self {
            Self::Answered { reply } => reply,
            Self::Empty => EMPTY_MENTION_MESSAGE,
            Self::TooLong => TOO_LONG_MESSAGE,
            Self::CompletionFailed => APOLOGY_MESSAGE,
            Self::Failed => FAILURE_MESSAGE,
        }
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Answered { .. } => "answered",
            Self::Empty => "empty",
            Self::TooLong => "too_long",
            Self::CompletionFailed => "completion_failed",
            Self::Failed => "failed",
        }
    }
}

/// Remove the bot's own mention token from `text`.
///
/// With a known bot id every `<@BOT>` / `<@BOT|label>` token is removed.
/// Without one, a single leading `<@...>` token is taken to be the bot.
pub fn strip_mention(text: &str, bot_user_id: Option<&str>) -> String {
    match bot_user_id {
        Some(bot) => {
            let prefix = format!("<@{bot}");
            let mut stripped = text.to_string();
            let mut from = 0;
            while let Some(offset) = stripped[from..].find(&prefix) {
                let start = from + offset;
                let rest = &stripped[start + prefix.len()..];
                let end = match rest.chars().next() {
                    Some('>') => start + prefix.len() + 1,
                    Some('|') => match rest.find('>') {
                        Some(close) => start + prefix.len() + close + 1,
                        None => break,
                    },
                    // a longer user id that merely starts with ours
                    _ => {
                        from = start + prefix.len();
                        continue;
                    }
                };
                stripped = join_around(&stripped, start, end);
                from = 0;
            }
            stripped.trim().to_string()
        }
        None => {
            let trimmed = text.trim_start();
            if trimmed.starts_with("<@") {
                if let Some(end) = trimmed.find('>') {
                    return trimmed[end + 1..].trim().to_string();
                }
            }
            trimmed.trim_end().to_string()
        }
    }
}

/// Cut `start..end` out of `text`, leaving one space where the cut was.
fn join_around(text: &str, start: usize, end: usize) -> String {
    let before = text[..start].trim_end();
    let after = text[end..].trim_start();
    if before.is_empty() || after.is_empty() {
        format!("{before}{after}")
    } else {
        format!("{before} {after}")
    }
}

/// Glues history, windowing and the completion provider together.
pub struct RelayService {
    store: Arc<dyn HistoryStore>,
    provider: Arc<dyn AIProvider>,
    counter: Arc<dyn TokenCounter>,
    identity: Arc<dyn IdentityResolver>,
    settings: RelaySettings,
}

impl RelayService {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        provider: Arc<dyn AIProvider>,
        counter: Arc<dyn TokenCounter>,
        identity: Arc<dyn IdentityResolver>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            provider,
            counter,
            identity,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Handle one mention end to end and report what to send back.
    ///
    /// The user turn is persisted before the completion call and kept even if
    /// the call fails; the assistant turn only after a successful completion.
    #[tracing::instrument(
        name = "relay.mention",
        skip(self, event),
        fields(conversation = %event.conversation_id, sender = %event.sender_id)
    )]
    pub async fn handle_mention(&self, event: MentionEvent) -> RelayOutcome {
        metrics::MENTIONS_RECEIVED.inc();
        let outcome = self.relay(event).await;
        metrics::RELAY_OUTCOMES
            .with_label_values(&[outcome.kind()])
            .inc();
        outcome
    }

    async fn relay(&self, event: MentionEvent) -> RelayOutcome {
        let conversation = &event.conversation_id;
        let text = strip_mention(&event.text, self.settings.bot_user_id.as_deref());
        if text.is_empty() {
            debug!("mention carried no text");
            return RelayOutcome::Empty;
        }

        let speaker = self.resolve_speaker(&event.sender_id).await;

        let history = match self.store.all(conversation).await {
            Ok(history) => history,
            Err(err) => {
                error!(error = %err, "failed to load conversation history");
                return RelayOutcome::Failed;
            }
        };

        let window = match self.settings.window.build(
            self.counter.as_ref(),
            &self.settings.model,
            &self.settings.system_prompt,
            &history,
            &text,
        ) {
            Ok(window) => window,
            Err(ContextError::RejectedTooLong { tokens, budget }) => {
                info!(tokens, budget, "rejected message exceeding token budget");
                return RelayOutcome::TooLong;
            }
            Err(err) => {
                error!(error = %err, model = %self.settings.model, "failed to build context window");
                return RelayOutcome::Failed;
            }
        };
        metrics::HISTORY_DROPPED.inc_by(window.dropped as f64);
        debug!(
            retained = window.retained,
            dropped = window.dropped,
            prompt_tokens = window.prompt_tokens,
            "context window built"
        );

        if let Err(err) = self
            .store
            .append(conversation, &speaker, MessageRole::User, &text)
            .await
        {
            error!(error = %err, "failed to persist user turn, not calling provider");
            return RelayOutcome::Failed;
        }

        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: window.messages,
            max_tokens: Some(self.settings.max_output_tokens),
            temperature: Some(self.settings.temperature),
        };

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.settings.completion_timeout,
            self.provider.complete(request),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout));
        metrics::COMPLETION_LATENCY
            .with_label_values(&[self.provider.name()])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(provider = self.provider.name(), error = %err, "completion failed");
                metrics::COMPLETION_ERRORS
                    .with_label_values(&[self.provider.name(), err.kind()])
                    .inc();
                return RelayOutcome::CompletionFailed;
            }
        };

        if let Err(err) = self
            .store
            .append(conversation, AI_SPEAKER, MessageRole::Assistant, &response.content)
            .await
        {
            error!(error = %err, "failed to persist assistant turn, relaying reply anyway");
        }

        RelayOutcome::Answered {
            reply: response.content,
        }
    }

    async fn resolve_speaker(&self, user_id: &str) -> String {
        match self.identity.display_name(user_id).await {
            Ok(name) if !name.trim().is_empty() => name,
            Ok(_) => FALLBACK_SPEAKER.to_string(),
            Err(err) => {
                warn!(user_id, error = %err, "identity lookup failed, using placeholder name");
                FALLBACK_SPEAKER.to_string()
            }
        }
    }

    /// Clear a conversation's history. Clearing an empty history is fine.
    pub async fn reset(&self, conversation: &ConversationId) -> Result<&'static str, HistoryError> {
        let removed = self.store.clear(conversation).await?;
        metrics::RESETS_TOTAL.inc();
        info!(conversation = %conversation, removed, "conversation history reset");
        Ok(RESET_CONFIRMATION)
    }
}
