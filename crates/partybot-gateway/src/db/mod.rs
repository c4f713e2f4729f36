//! Database and repository layer for conversation history.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use partybot_context::{ConversationId, Message, MessageId, MessageRole};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;

/// Database connection pool type used by history persistence.
pub type DatabasePool = SqlitePool;

/// SQL schema for the `history` table.
///
/// `AUTOINCREMENT` keeps ids monotonic across clears; a cleared id is never
/// handed out again.
pub const HISTORY_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    speaker TEXT NOT NULL,
    role TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);"#;

/// Index backing per-conversation reads in insertion order.
pub const HISTORY_INDEX_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS history_conversation_idx ON history (conversation_id, id);"#;

/// Error type returned by history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Database query failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
    /// A stored row could not be mapped back to a message.
    #[error("corrupt history row {id}: {reason}")]
    CorruptRow {
        /// Row id.
        id: MessageId,
        /// What was wrong with it.
        reason: String,
    },
}

/// Append-only, per-conversation message log.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist one message and return its insertion index.
    async fn append(
        &self,
        conversation: &ConversationId,
        speaker: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<MessageId, HistoryError>;
    /// Every message of the conversation, oldest first.
    async fn all(&self, conversation: &ConversationId) -> Result<Vec<Message>, HistoryError>;
    /// Remove every message of the conversation. Returns rows removed.
    async fn clear(&self, conversation: &ConversationId) -> Result<u64, HistoryError>;
}

/// Create an SQLite connection pool, creating the database file if needed.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<DatabasePool, HistoryError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // Every connection to `:memory:` opens its own database, so pin a single
    // connection that is never recycled.
    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
    };

    Ok(pool.connect_with(options).await?)
}

/// Initialize required tables if they do not exist.
pub async fn initialize_schema(pool: &DatabasePool) -> Result<(), HistoryError> {
    sqlx::query(HISTORY_TABLE_SCHEMA).execute(pool).await?;
    sqlx::query(HISTORY_INDEX_SCHEMA).execute(pool).await?;
    Ok(())
}

/// SQLx/SQLite implementation of [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct SqlxHistoryStore {
    pool: DatabasePool,
}

impl SqlxHistoryStore {
    /// Build a store over an existing pool. The schema must already exist.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open `database_url` and make sure the schema is in place.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, HistoryError> {
        let pool = init_pool(database_url, max_connections).await?;
        initialize_schema(&pool).await?;
        Ok(Self::new(pool))
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message, HistoryError> {
    let id: MessageId = row.try_get("id")?;
    let role: String = row.try_get("role")?;
    let role = role.parse::<MessageRole>().map_err(|err| HistoryError::CorruptRow {
        id,
        reason: err.to_string(),
    })?;
    let conversation_id: String = row.try_get("conversation_id")?;

    Ok(Message {
        id,
        conversation_id: ConversationId::new(conversation_id),
        speaker: row.try_get("speaker")?,
        role,
        content: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl HistoryStore for SqlxHistoryStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        speaker: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<MessageId, HistoryError> {
        let result = sqlx::query(
            "INSERT INTO history (conversation_id, speaker, role, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(conversation.as_str())
        .bind(speaker)
        .bind(role.as_str())
        .bind(text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn all(&self, conversation: &ConversationId) -> Result<Vec<Message>, HistoryError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, speaker, role, message, created_at FROM history WHERE conversation_id = ?1 ORDER BY id ASC",
        )
        .bind(conversation.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn clear(&self, conversation: &ConversationId) -> Result<u64, HistoryError> {
        let result = sqlx::query("DELETE FROM history WHERE conversation_id = ?1")
            .bind(conversation.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    last_id: MessageId,
    conversations: HashMap<ConversationId, Vec<Message>>,
}

/// Process-local [`HistoryStore`]; history is lost on restart.
#[derive(Debug, Default, Clone)]
pub struct InMemoryHistoryStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        speaker: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<MessageId, HistoryError> {
        let mut state = self.state.write().await;
        state.last_id += 1;
        let message = Message {
            id: state.last_id,
            conversation_id: conversation.clone(),
            speaker: speaker.to_string(),
            role,
            content: text.to_string(),
            created_at: Utc::now(),
        };
        let id = message.id;
        state
            .conversations
            .entry(conversation.clone())
            .or_default()
            .push(message);
        Ok(id)
    }

    async fn all(&self, conversation: &ConversationId) -> Result<Vec<Message>, HistoryError> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, conversation: &ConversationId) -> Result<u64, HistoryError> {
        let removed = self
            .state
            .write()
            .await
            .conversations
            .remove(conversation)
            .map_or(0, |messages| messages.len() as u64);
        Ok(removed)
    }
}
