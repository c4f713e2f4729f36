//! Partybot Gateway entry point

use std::sync::Arc;

use axum::Router;
use partybot_context::{HeuristicCounter, TiktokenCounter, TokenCounter};
use partybot_gateway::{
    build_routes, metrics, AppState, GatewayConfig, HistoryStore, InMemoryHistoryStore,
    RelayService, SlackClient, SqlxHistoryStore, TokenizerKind,
};
use partybot_runtime::OpenAIProvider;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "partybot_gateway=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Partybot Gateway v{}", partybot_gateway::GATEWAY_VERSION);

    let config = GatewayConfig::from_env()?;
    metrics::init_metrics();

    let store: Arc<dyn HistoryStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Persisting history to {}", url);
            Arc::new(SqlxHistoryStore::connect(url, config.database_max_connections).await?)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, history is kept in memory only");
            Arc::new(InMemoryHistoryStore::new())
        }
    };

    let counter: Arc<dyn TokenCounter> = match config.tokenizer {
        TokenizerKind::Tiktoken => Arc::new(TiktokenCounter::new()),
        TokenizerKind::Heuristic => Arc::new(HeuristicCounter),
    };

    let provider = Arc::new(OpenAIProvider::new(config.openai.clone())?);
    let slack = Arc::new(SlackClient::new(config.slack.clone())?);

    if config.slack.signing_secret.is_none() {
        tracing::warn!("SLACK_SIGNING_SECRET not set, accepting unsigned Slack requests");
    }

    let relay = RelayService::new(store, provider, counter, slack.clone(), config.relay.clone());
    let state = AppState {
        relay: Arc::new(relay),
        replies: slack,
        signing_secret: config.slack.signing_secret.as_deref().map(Arc::from),
    };

    // Build router
    let app = Router::new()
        .merge(build_routes(state))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
