//! Partybot Gateway
//!
//! Slack-facing half of Partybot:
//! - Slack Events API and slash command webhooks
//! - Conversation history persistence
//! - Relay of mentions through the context window to the completion provider
//! - Metrics and health endpoints

pub mod config;
pub mod db;
pub mod metrics;
pub mod relay;
pub mod router;
pub mod slack;

pub use config::{ConfigError, GatewayConfig, RelaySettings, SlackConfig, TokenizerKind};
pub use db::{HistoryError, HistoryStore, InMemoryHistoryStore, SqlxHistoryStore};
pub use relay::{
    IdentityResolver, MentionEvent, OutgoingReply, RelayOutcome, RelayService, ReplySink,
};
pub use router::{build_routes, AppState};
pub use slack::{SlackClient, SlackError};

/// Gateway version
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
