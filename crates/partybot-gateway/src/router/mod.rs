//! HTTP routes for the Partybot gateway

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use partybot_context::ConversationId;
use tracing::{debug, error, warn};

use crate::metrics;
use crate::relay::{MentionEvent, OutgoingReply, RelayService, ReplySink};
use crate::slack::{self, SlackEnvelope, SlackEvent, SlashCommand, RETRY_NUM_HEADER};

const RESET_COMMAND: &str = "/reset";
const UNKNOWN_COMMAND_MESSAGE: &str = "Sorry, I don't know that command.";
const RESET_FAILED_MESSAGE: &str = "Sorry, I couldn't reset the conversation. Please try again later.";

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub replies: Arc<dyn ReplySink>,
    /// `None` accepts unsigned requests.
    pub signing_secret: Option<Arc<str>>,
}

/// Build the main router for the gateway
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/slack/events", post(slack_events))
        .route("/slack/commands", post(slack_commands))
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler() -> Response {
    match metrics::export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn check_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let Some(secret) = state.signing_secret.as_deref() else {
        return Ok(());
    };
    let now = chrono::Utc::now().timestamp();
    slack::signature::verify(secret, headers, body, now).map_err(|err| {
        warn!(error = %err, "rejected slack request");
        StatusCode::UNAUTHORIZED.into_response()
    })
}

/// Slack Events API endpoint
async fn slack_events(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = check_signature(&state, &headers, &body) {
        return rejection;
    }

    if let Some(retry) = headers.get(RETRY_NUM_HEADER) {
        debug!(retry = ?retry, "skipping slack redelivery");
        return StatusCode::OK.into_response();
    }

    let envelope: SlackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "malformed slack event payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match envelope.envelope_type.as_str() {
        "url_verification" => (
            [(header::CONTENT_TYPE, "text/plain")],
            envelope.challenge.unwrap_or_default(),
        )
            .into_response(),
        "event_callback" => {
            if let Some(event) = envelope.event {
                dispatch_event(&state, event);
            }
            StatusCode::OK.into_response()
        }
        other => {
            debug!(envelope_type = other, "ignoring slack envelope");
            StatusCode::OK.into_response()
        }
    }
}

/// Hand an app mention to a background task; everything else is ignored.
fn dispatch_event(state: &AppState, event: SlackEvent) {
    if event.event_type != "app_mention" || event.bot_id.is_some() {
        debug!(event_type = %event.event_type, "ignoring slack event");
        return;
    }
    let (Some(user), Some(channel)) = (event.user, event.channel) else {
        warn!("app_mention without user or channel");
        return;
    };

    let mention = MentionEvent {
        conversation_id: ConversationId::new(channel.clone()),
        sender_id: user,
        text: event.text.unwrap_or_default(),
    };
    let relay = Arc::clone(&state.relay);
    let replies = Arc::clone(&state.replies);

    tokio::spawn(async move {
        let outcome = relay.handle_mention(mention).await;
        let reply = OutgoingReply {
            channel,
            thread_ts: event.thread_ts,
            text: outcome.message().to_string(),
        };
        if let Err(err) = replies.post_reply(&reply).await {
            error!(channel = %reply.channel, error = %err, "failed to post reply");
        }
    });
}

/// Slash command endpoint
async fn slack_commands(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = check_signature(&state, &headers, &body) {
        return rejection;
    }

    let command = SlashCommand::from_form(&body);
    if command.command != RESET_COMMAND {
        debug!(command = %command.command, "unknown slash command");
        return UNKNOWN_COMMAND_MESSAGE.into_response();
    }
    if command.channel_id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    match state.relay.reset(&ConversationId::new(command.channel_id)).await {
        Ok(confirmation) => confirmation.into_response(),
        Err(err) => {
            error!(error = %err, "failed to reset conversation");
            RESET_FAILED_MESSAGE.into_response()
        }
    }
}
