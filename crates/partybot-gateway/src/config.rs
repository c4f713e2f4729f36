//! Gateway configuration read from the environment.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use partybot_context::ContextWindow;
use partybot_runtime::OpenAIConfig;
use thiserror::Error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are PartyBot, a friendly assistant in a team chat. Keep answers short and fun.";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Which token counter backs the context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    /// Exact BPE counts; unknown models are rejected.
    Tiktoken,
    /// Byte-based estimate, accepts any model.
    Heuristic,
}

impl FromStr for TokenizerKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tiktoken" => Ok(Self::Tiktoken),
            "heuristic" => Ok(Self::Heuristic),
            _ => Err(()),
        }
    }
}

/// Settings for the relay and its completion calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub model: String,
    pub window: ContextWindow,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub completion_timeout: Duration,
    /// Slack user id of the bot, used to strip `<@BOT>` from mentions.
    pub bot_user_id: Option<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            window: ContextWindow::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_output_tokens: 256,
            temperature: 0.7,
            completion_timeout: Duration::from_secs(60),
            bot_user_id: None,
        }
    }
}

/// Slack credentials and endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackConfig {
    pub bot_token: String,
    /// `None` disables request signature verification.
    pub signing_secret: Option<String>,
    pub api_base: String,
}

impl SlackConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            signing_secret: None,
            api_base: DEFAULT_SLACK_API_BASE.to_string(),
        }
    }
}

/// Full gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// SQLite URL; history is kept in memory when unset.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub tokenizer: TokenizerKind,
    pub relay: RelaySettings,
    pub slack: SlackConfig,
    pub openai: OpenAIConfig,
}

impl GatewayConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = RelaySettings::default();

        let bind_addr = parse_or(&var, "PARTYBOT_BIND_ADDR", || {
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
        })?;

        let completion_timeout = Duration::from_secs(parse_or(
            &var,
            "PARTYBOT_COMPLETION_TIMEOUT_SECS",
            || defaults.completion_timeout.as_secs(),
        )?);

        let max_tokens: usize = parse_or(&var, "PARTYBOT_TOKEN_BUDGET", || {
            defaults.window.max_tokens
        })?;
        if max_tokens == 0 {
            return Err(ConfigError::Invalid {
                name: "PARTYBOT_TOKEN_BUDGET",
                value: "0".to_string(),
            });
        }

        let relay = RelaySettings {
            model: var("PARTYBOT_MODEL").unwrap_or(defaults.model),
            window: ContextWindow::new(max_tokens),
            system_prompt: var("PARTYBOT_SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            max_output_tokens: parse_or(&var, "PARTYBOT_MAX_OUTPUT_TOKENS", || {
                defaults.max_output_tokens
            })?,
            temperature: parse_or(&var, "PARTYBOT_TEMPERATURE", || defaults.temperature)?,
            completion_timeout,
            bot_user_id: var("SLACK_BOT_USER_ID"),
        };

        let tokenizer = match var("PARTYBOT_TOKENIZER") {
            None => TokenizerKind::Tiktoken,
            Some(value) => value.parse().map_err(|()| ConfigError::Invalid {
                name: "PARTYBOT_TOKENIZER",
                value,
            })?,
        };

        let slack = SlackConfig {
            bot_token: var("SLACK_BOT_TOKEN").ok_or(ConfigError::Missing("SLACK_BOT_TOKEN"))?,
            signing_secret: var("SLACK_SIGNING_SECRET"),
            api_base: var("SLACK_API_BASE").unwrap_or_else(|| DEFAULT_SLACK_API_BASE.to_string()),
        };

        let mut openai =
            OpenAIConfig::new(var("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?)
                .with_timeout(completion_timeout);
        if let Some(base_url) = var("OPENAI_API_BASE") {
            openai = openai.with_base_url(base_url);
        }

        Ok(Self {
            bind_addr,
            database_url: var("DATABASE_URL"),
            database_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", || 5)?,
            tokenizer,
            relay,
            slack,
            openai,
        })
    }
}

fn parse_or<T, V, D>(var: &V, name: &'static str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
    D: FnOnce() -> T,
{
    match var(name) {
        None => Ok(default()),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
