//! E2E tests for the Slack mention relay over HTTP

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use httpmock::prelude::*;
use httpmock::Mock;
use partybot_context::{
    ContextWindow, ConversationId, HeuristicCounter, MessageRole, TiktokenCounter, TokenCounter,
};
use partybot_gateway::slack::signature::sign;
use partybot_gateway::slack::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use partybot_gateway::{
    build_routes, AppState, HistoryStore, RelaySettings, RelayService, SlackClient, SlackConfig,
    SqlxHistoryStore,
};
use partybot_runtime::{OpenAIConfig, OpenAIProvider};
use serde_json::json;
use tokio::net::TcpListener;

const SECRET: &str = "e2e-signing-secret";
const CHANNEL: &str = "C0PARTY";

struct Gateway {
    addr: std::net::SocketAddr,
    store: SqlxHistoryStore,
    handle: tokio::task::JoinHandle<()>,
}

async fn spawn_gateway(
    upstream: &MockServer,
    counter: Arc<dyn TokenCounter>,
    settings: RelaySettings,
) -> Gateway {
    let store = SqlxHistoryStore::connect("sqlite::memory:", 1)
        .await
        .expect("open in-memory history");

    let provider = OpenAIProvider::new(
        OpenAIConfig::new("sk-e2e").with_base_url(upstream.url("/v1")),
    )
    .expect("build openai provider");

    let mut slack_config = SlackConfig::new("xoxb-e2e");
    slack_config.api_base = upstream.base_url();
    let slack = Arc::new(SlackClient::new(slack_config).expect("build slack client"));

    let relay = RelayService::new(
        Arc::new(store.clone()),
        Arc::new(provider),
        counter,
        slack.clone(),
        settings,
    );
    let app: Router = build_routes(AppState {
        relay: Arc::new(relay),
        replies: slack,
        signing_secret: Some(Arc::from(SECRET)),
    });

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve gateway app");
    });

    Gateway {
        addr,
        store,
        handle,
    }
}

fn settings() -> RelaySettings {
    RelaySettings {
        bot_user_id: Some("UBOT".to_string()),
        system_prompt: "You are PartyBot.".to_string(),
        ..RelaySettings::default()
    }
}

async fn post_signed(
    addr: std::net::SocketAddr,
    path: &str,
    content_type: &str,
    body: String,
) -> reqwest::Response {
    let now = chrono::Utc::now().timestamp();
    reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .header("content-type", content_type)
        .header(TIMESTAMP_HEADER, now.to_string())
        .header(SIGNATURE_HEADER, sign(SECRET, now, body.as_bytes()))
        .body(body)
        .send()
        .await
        .expect("gateway request")
}

async fn mention(addr: std::net::SocketAddr, text: &str) -> reqwest::Response {
    let body = json!({
        "type": "event_callback",
        "event": {
            "type": "app_mention",
            "user": "U0ALICE",
            "text": format!("<@UBOT> {text}"),
            "channel": CHANNEL,
            "ts": "1700000000.000100"
        }
    });
    post_signed(addr, "/slack/events", "application/json", body.to_string()).await
}

async fn wait_for_hits(mock: &Mock<'_>, hits: usize) {
    for _ in 0..250 {
        if mock.hits_async().await >= hits {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {hits} hits, saw {}", mock.hits_async().await);
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-e2e",
        "object": "chat.completion",
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
    })
}

#[tokio::test]
async fn mention_reply_history_and_reset() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(GET)
                .path("/users.info")
                .query_param("user", "U0ALICE");
            then.status(200).json_body(json!({
                "ok": true,
                "user": {"id": "U0ALICE", "name": "alice", "real_name": "Alice"}
            }));
        })
        .await;
    let mut first_reply = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-e2e")
                .body_includes("Tell me a joke");
            then.status(200).json_body(completion("Why did the crab never share?"));
        })
        .await;
    let posted_first = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.postMessage")
                .body_includes("Why did the crab never share?");
            then.status(200).json_body(json!({"ok": true}));
        })
        .await;

    let gateway = spawn_gateway(&upstream, Arc::new(TiktokenCounter::new()), settings()).await;
    let conversation = ConversationId::new(CHANNEL);

    let response = mention(gateway.addr, "Tell me a joke").await;
    assert!(response.status().is_success());
    wait_for_hits(&posted_first, 1).await;
    first_reply.assert_async().await;

    let history = gateway.store.all(&conversation).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].speaker, "Alice");
    assert_eq!(history[0].role, MessageRole::User);
    assert_eq!(history[0].content, "Tell me a joke");
    assert_eq!(history[1].speaker, "AI");
    assert_eq!(history[1].role, MessageRole::Assistant);

    // The second turn must carry the first exchange as context.
    first_reply.delete_async().await;
    let second_reply = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes("You are PartyBot.")
                .body_includes("Why did the crab never share?")
                .body_includes("Another one");
            then.status(200).json_body(completion("Because he was shellfish."));
        })
        .await;
    let posted_second = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.postMessage")
                .body_includes("Because he was shellfish.");
            then.status(200).json_body(json!({"ok": true}));
        })
        .await;

    mention(gateway.addr, "Another one").await;
    wait_for_hits(&posted_second, 1).await;
    second_reply.assert_async().await;
    assert_eq!(gateway.store.all(&conversation).await.unwrap().len(), 4);

    let response = post_signed(
        gateway.addr,
        "/slack/commands",
        "application/x-www-form-urlencoded",
        format!("command=%2Freset&text=&channel_id={CHANNEL}&user_id=U0ALICE"),
    )
    .await;
    assert!(response.status().is_success());
    assert_eq!(
        response.text().await.unwrap(),
        "Conversation history has been reset."
    );
    assert!(gateway.store.all(&conversation).await.unwrap().is_empty());

    gateway.handle.abort();
}

#[tokio::test]
async fn oversized_mention_is_refused_without_calling_openai() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(GET).path("/users.info");
            then.status(200)
                .json_body(json!({"ok": true, "user": {"name": "alice"}}));
        })
        .await;
    let completions = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion("unreachable"));
        })
        .await;
    let refusal = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat.postMessage")
                .body_includes("too long");
            then.status(200).json_body(json!({"ok": true}));
        })
        .await;

    let tight = RelaySettings {
        window: ContextWindow::new(64),
        ..settings()
    };
    let gateway = spawn_gateway(&upstream, Arc::new(HeuristicCounter), tight).await;

    let response = mention(gateway.addr, &"blah ".repeat(100)).await;
    assert!(response.status().is_success());
    wait_for_hits(&refusal, 1).await;

    assert_eq!(completions.hits_async().await, 0);
    assert!(gateway
        .store
        .all(&ConversationId::new(CHANNEL))
        .await
        .unwrap()
        .is_empty());

    gateway.handle.abort();
}

#[tokio::test]
async fn unsigned_events_are_rejected() {
    let upstream = MockServer::start_async().await;
    let gateway = spawn_gateway(&upstream, Arc::new(HeuristicCounter), settings()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/slack/events", gateway.addr))
        .header("content-type", "application/json")
        .body(r#"{"type":"url_verification","challenge":"abc"}"#)
        .send()
        .await
        .expect("gateway request");

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    gateway.handle.abort();
}
