//! Slack adapter: Events API payloads, slash commands and the Web API client.

pub mod signature;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SlackConfig;
use crate::relay::{IdentityResolver, OutgoingReply, ReplySink};

pub use signature::{SignatureError, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Header Slack sets on redelivered events.
pub const RETRY_NUM_HEADER: &str = "x-slack-retry-num";

// ---------------------------------------------------------------------------
// Slack wire types
// ---------------------------------------------------------------------------

/// Top-level event envelope from the Slack Events API.
#[derive(Debug, Deserialize)]
pub struct SlackEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: String,
    /// Present on `url_verification` challenges.
    pub challenge: Option<String>,
    /// Present on `event_callback`.
    pub event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub user: Option<String>,
    pub text: Option<String>,
    pub channel: Option<String>,
    pub ts: Option<String>,
    pub thread_ts: Option<String>,
    /// Set for messages posted by bots, including this one.
    pub bot_id: Option<String>,
}

/// Slash command invocation, decoded from its form body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub command: String,
    pub text: String,
    pub channel_id: String,
    pub user_id: String,
}

impl SlashCommand {
    pub fn from_form(body: &[u8]) -> Self {
        let mut command = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "command" => command.command = value.into_owned(),
                "text" => command.text = value.into_owned(),
                "channel_id" => command.channel_id = value.into_owned(),
                "user_id" => command.user_id = value.into_owned(),
                _ => {}
            }
        }
        command
    }
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    error: Option<String>,
    user: Option<SlackUser>,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    name: Option<String>,
    real_name: Option<String>,
    profile: Option<SlackProfile>,
}

#[derive(Debug, Deserialize)]
struct SlackProfile {
    real_name: Option<String>,
    display_name: Option<String>,
}

impl SlackUser {
    /// Best human readable name, preferring the real name.
    fn best_name(self) -> Option<String> {
        let profile = self.profile.unwrap_or(SlackProfile {
            real_name: None,
            display_name: None,
        });
        [self.real_name, profile.real_name, profile.display_name, self.name]
            .into_iter()
            .flatten()
            .find(|name| !name.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Web API client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("slack transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("slack API error: {0}")]
    Api(String),
    #[error("slack user {0} has no usable name")]
    NoName(String),
}

/// Minimal Slack Web API client for `users.info` and `chat.postMessage`.
#[derive(Debug, Clone)]
pub struct SlackClient {
    client: Client,
    config: SlackConfig,
}

impl SlackClient {
    pub fn new(config: SlackConfig) -> Result<Self, SlackError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), method)
    }

    fn check(response: ApiResponse) -> Result<ApiResponse, SlackError> {
        if response.ok {
            Ok(response)
        } else {
            Err(SlackError::Api(
                response.error.unwrap_or_else(|| "unknown_error".to_string()),
            ))
        }
    }

    /// Resolve a user id to the name shown for them in history.
    pub async fn user_name(&self, user_id: &str) -> Result<String, SlackError> {
        let response: ApiResponse = self
            .client
            .get(self.endpoint("users.info"))
            .bearer_auth(&self.config.bot_token)
            .query(&[("user", user_id)])
            .send()
            .await?
            .json()
            .await?;

        Self::check(response)?
            .user
            .and_then(SlackUser::best_name)
            .ok_or_else(|| SlackError::NoName(user_id.to_string()))
    }

    /// Post `text` to `channel`, inside `thread_ts` when given.
    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<(), SlackError> {
        let response: ApiResponse = self
            .client
            .post(self.endpoint("chat.postMessage"))
            .bearer_auth(&self.config.bot_token)
            .json(&PostMessage {
                channel,
                text,
                thread_ts,
            })
            .send()
            .await?
            .json()
            .await?;

        Self::check(response).map(|_| ())
    }
}

#[async_trait]
impl IdentityResolver for SlackClient {
    async fn display_name(&self, user_id: &str) -> anyhow::Result<String> {
        Ok(self.user_name(user_id).await?)
    }
}

#[async_trait]
impl ReplySink for SlackClient {
    async fn post_reply(&self, reply: &OutgoingReply) -> anyhow::Result<()> {
        self.post_message(&reply.channel, &reply.text, reply.thread_ts.as_deref())
            .await?;
        Ok(())
    }
}
